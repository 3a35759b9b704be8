//! A bounded in-memory pipe between a producer pushing fetched content and a consumer reading it.

use crate::error::StreamError;
use crate::helpers::{lock, wait};
use crate::stream::{AsyncInputStream, PendingCallback, ReadyCallback, StreamCondition, WaitFlags};
use crate::target::{EventTarget, Task};
use bytes::{Buf, BytesMut};
use log::*;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

struct PipeState {
    buffer: BytesMut,
    capacity: usize,
    reader: StreamCondition,
    writer: StreamCondition,
    read_waiter: Option<PendingCallback>,
    write_waiter: Option<PendingCallback>,
    on_reader_closed: Option<Task>,
}

impl PipeState {
    /// The condition the reading end observes once the buffer has been drained.
    fn read_condition(&self) -> StreamCondition {
        match (&self.reader, self.buffer.is_empty()) {
            (StreamCondition::Open, true) => self.writer.clone(),
            (StreamCondition::Open, false) => StreamCondition::Open,
            (closed, _) => closed.clone(),
        }
    }

    fn is_readable(&self, flags: WaitFlags) -> bool {
        let closed = self.read_condition().is_closed();
        closed || (!flags.contains(WaitFlags::CLOSURE_ONLY) && !self.buffer.is_empty())
    }

    fn space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }
}

struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
    non_blocking: bool,
    /// Where untargeted callbacks run. Without one they run on the thread that made the pipe ready.
    fallback: Option<Arc<dyn EventTarget>>,
}

impl Pipe {
    fn state(&self) -> MutexGuard<'_, PipeState> {
        lock(&self.state)
    }

    fn deliver(&self, pending: Option<PendingCallback>) {
        if let Some(pending) = pending {
            pending.deliver(self.fallback.as_deref());
        }
    }
}

/// The readable end of a pipe created with [`new_pipe`]. Dropping it closes the pipe for reading.
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

/// The writable end of a pipe created with [`new_pipe`]. Dropping it without closing it aborts the pipe.
pub struct PipeWriter {
    pipe: Arc<Pipe>,
}

/// Creates a pipe holding at most `segment_count` segments of `segment_size` bytes.
///
/// With `non_blocking_input` unset, reads on the readable end wait for data instead of failing with
/// [`StreamError::WouldBlock`].
pub fn new_pipe(segment_size: usize, segment_count: usize, non_blocking_input: bool) -> (PipeReader, PipeWriter) {
    create(segment_size, segment_count, non_blocking_input, None)
}

/// Like [`new_pipe`], but callbacks registered without a target of their own are posted to `target`.
pub(crate) fn new_pipe_on(
    segment_size: usize,
    segment_count: usize,
    non_blocking_input: bool,
    target: Arc<dyn EventTarget>,
) -> (PipeReader, PipeWriter) {
    create(segment_size, segment_count, non_blocking_input, Some(target))
}

fn create(
    segment_size: usize,
    segment_count: usize,
    non_blocking: bool,
    fallback: Option<Arc<dyn EventTarget>>,
) -> (PipeReader, PipeWriter) {
    let capacity = segment_size.max(1).saturating_mul(segment_count.max(1));
    let state = PipeState {
        buffer: BytesMut::with_capacity(capacity),
        capacity,
        reader: StreamCondition::Open,
        writer: StreamCondition::Open,
        read_waiter: None,
        write_waiter: None,
        on_reader_closed: None,
    };
    let pipe = Arc::new(Pipe { state: Mutex::new(state), readable: Condvar::new(), non_blocking, fallback });
    (PipeReader { pipe: Arc::clone(&pipe) }, PipeWriter { pipe })
}

impl AsyncInputStream for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut state = self.pipe.state();
        loop {
            if state.reader.is_closed() {
                return state.reader.read_result();
            }
            if !state.buffer.is_empty() {
                if buf.is_empty() {
                    return Ok(0);
                }
                let n = buf.len().min(state.buffer.len());
                buf[..n].copy_from_slice(&state.buffer[..n]);
                state.buffer.advance(n);
                let waiter = state.write_waiter.take();
                drop(state);
                self.pipe.deliver(waiter);
                return Ok(n);
            }
            if state.writer.is_closed() {
                return state.writer.read_result();
            }
            if self.pipe.non_blocking {
                return Err(StreamError::WouldBlock);
            }
            state = wait(&self.pipe.readable, state);
        }
    }

    fn available(&self) -> Result<usize, StreamError> {
        let state = self.pipe.state();
        match state.buffer.len() {
            0 => match state.read_condition() {
                StreamCondition::Open => Ok(0),
                closed => closed.read_result(),
            },
            n if !state.reader.is_closed() => Ok(n),
            _ => state.reader.read_result(),
        }
    }

    fn is_non_blocking(&self) -> bool {
        self.pipe.non_blocking
    }

    fn close_with_status(&self, reason: StreamError) {
        let (read_waiter, write_waiter, hook) = {
            let mut state = self.pipe.state();
            if state.reader.is_closed() {
                return;
            }
            state.reader = StreamCondition::from_reason(reason);
            state.buffer.clear();
            trace!("Pipe closed for reading: {:?}", state.reader);
            (state.read_waiter.take(), state.write_waiter.take(), state.on_reader_closed.take())
        };
        self.pipe.readable.notify_all();
        if let Some(hook) = hook {
            hook();
        }
        self.pipe.deliver(read_waiter);
        self.pipe.deliver(write_waiter);
    }

    fn async_wait(
        &self,
        callback: Option<ReadyCallback>,
        flags: WaitFlags,
        target: Option<Arc<dyn EventTarget>>,
    ) -> Result<(), StreamError> {
        let mut state = self.pipe.state();
        let Some(callback) = callback else {
            state.read_waiter = None;
            return Ok(());
        };
        let pending = PendingCallback::new(callback, flags, target);
        if state.is_readable(flags) {
            state.read_waiter = None;
            drop(state);
            self.pipe.deliver(Some(pending));
        } else {
            state.read_waiter = Some(pending);
        }
        Ok(())
    }

    fn condition(&self) -> StreamCondition {
        self.pipe.state().read_condition()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl PipeWriter {
    /// Copies as much of `data` into the pipe as fits. Fails with [`StreamError::WouldBlock`] when the pipe is full,
    /// and with the reader's status once the reader has gone away.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let mut state = self.pipe.state();
        if state.writer.is_closed() {
            return Err(StreamError::Closed);
        }
        if state.reader.is_closed() {
            return Err(state.reader.write_error());
        }
        let n = data.len().min(state.space());
        if n == 0 {
            return if data.is_empty() { Ok(0) } else { Err(StreamError::WouldBlock) };
        }
        state.buffer.extend_from_slice(&data[..n]);
        let waiter = match state.read_waiter.as_ref() {
            Some(pending) if pending.wants_data() => state.read_waiter.take(),
            _ => None,
        };
        drop(state);
        self.pipe.readable.notify_all();
        self.pipe.deliver(waiter);
        Ok(n)
    }

    /// The number of bytes that can be written without blocking.
    pub fn space(&self) -> Result<usize, StreamError> {
        let state = self.pipe.state();
        if state.writer.is_closed() {
            return Err(StreamError::Closed);
        }
        if state.reader.is_closed() {
            return Err(state.reader.write_error());
        }
        Ok(state.space())
    }

    /// Closes the writing end. [`StreamError::Closed`] marks the end of the content; the reader drains what is
    /// buffered first either way.
    pub fn close_with_status(&self, reason: StreamError) {
        let waiter = {
            let mut state = self.pipe.state();
            if state.writer.is_closed() {
                return;
            }
            state.writer = StreamCondition::from_reason(reason);
            trace!("Pipe closed for writing: {:?}", state.writer);
            state.on_reader_closed = None;
            state.read_waiter.take()
        };
        self.pipe.readable.notify_all();
        self.pipe.deliver(waiter);
    }

    pub fn close(&self) {
        self.close_with_status(StreamError::Closed)
    }

    /// Registers `callback` to run once there is space to write, or the reader has gone away.
    pub fn async_wait(&self, callback: ReadyCallback, target: Option<Arc<dyn EventTarget>>) {
        let pending = PendingCallback::new(callback, WaitFlags::NONE, target);
        let mut state = self.pipe.state();
        if state.space() > 0 || state.reader.is_closed() || state.writer.is_closed() {
            drop(state);
            self.pipe.deliver(Some(pending));
        } else {
            state.write_waiter = Some(pending);
        }
    }

    /// Runs `hook` on the closing thread as soon as the reading end closes, or right away if it already has.
    /// Closing the writing end first discards the hook.
    pub fn on_reader_closed(&self, hook: Task) {
        let mut state = self.pipe.state();
        if state.writer.is_closed() {
            return;
        }
        if state.reader.is_closed() {
            drop(state);
            hook();
        } else {
            state.on_reader_closed = Some(hook);
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close_with_status(StreamError::Aborted);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::worker::WorkerService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, ReadyCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&count);
        (count, Box::new(move || _ = c2.fetch_add(1, Ordering::SeqCst)))
    }

    #[test]
    fn writes_are_bounded_by_capacity() {
        let (reader, writer) = new_pipe(4, 2, true);
        assert_eq!(writer.space(), Ok(8));
        assert_eq!(writer.write(b"0123456789"), Ok(8));
        assert_eq!(writer.write(b"x"), Err(StreamError::WouldBlock));
        let mut buf = [0u8; 5];
        assert_eq!(reader.read(&mut buf), Ok(5));
        assert_eq!(&buf, b"01234");
        assert_eq!(reader.available(), Ok(3));
        assert_eq!(writer.space(), Ok(5));
    }

    #[test]
    fn empty_non_blocking_pipes_would_block() {
        let (reader, _writer) = new_pipe(4, 2, true);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(StreamError::WouldBlock));
        assert!(reader.is_non_blocking());
        assert_eq!(reader.condition(), StreamCondition::Open);
    }

    #[test]
    fn readers_drain_before_seeing_the_end() {
        let (reader, writer) = new_pipe(4, 2, true);
        writer.write(b"abc").unwrap();
        writer.close();
        assert_eq!(reader.condition(), StreamCondition::Open);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Ok(3));
        assert_eq!(reader.read(&mut buf), Ok(0));
        assert_eq!(reader.read(&mut buf), Ok(0));
        assert_eq!(reader.condition(), StreamCondition::ClosedNormal);
    }

    #[test]
    fn writer_errors_reach_the_reader() {
        let (reader, writer) = new_pipe(4, 2, true);
        writer.close_with_status(StreamError::ConnectFailure);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Err(StreamError::ConnectFailure));
        assert_eq!(reader.available(), Err(StreamError::ConnectFailure));
    }

    #[test]
    fn dropped_writers_abort_the_pipe() {
        let (reader, writer) = new_pipe(4, 2, true);
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Err(StreamError::Aborted));
    }

    #[test]
    fn closed_readers_refuse_writes() {
        let (reader, writer) = new_pipe(4, 2, true);
        reader.close_with_status(StreamError::Aborted);
        assert_eq!(writer.write(b"abc"), Err(StreamError::Aborted));
        drop(reader);
        assert_eq!(writer.space(), Err(StreamError::Aborted));
    }

    #[test]
    fn waiters_fire_once_on_data() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, callback) = counter();
        reader.async_wait(Some(callback), WaitFlags::NONE, None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        writer.write(b"a").unwrap();
        writer.write(b"b").unwrap();
        writer.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_only_waiters_ignore_data() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, callback) = counter();
        reader.async_wait(Some(callback), WaitFlags::CLOSURE_ONLY, None).unwrap();
        writer.write(b"a").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        writer.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_waiters_never_fire() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, callback) = counter();
        reader.async_wait(Some(callback), WaitFlags::NONE, None).unwrap();
        reader.async_wait(None, WaitFlags::NONE, None).unwrap();
        writer.write(b"a").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_pipes_wake_writers_once_drained() {
        let (reader, writer) = new_pipe(2, 1, true);
        writer.write(b"ab").unwrap();
        let (count, callback) = counter();
        writer.async_wait(callback, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let mut buf = [0u8; 1];
        reader.read(&mut buf).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closing_the_reader_runs_the_hook_once() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, hook) = counter();
        writer.on_reader_closed(hook);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        reader.close_with_status(StreamError::Aborted);
        drop(reader);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_reader_runs_the_hook() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, hook) = counter();
        writer.on_reader_closed(hook);
        drop(reader);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let (late, hook) = counter();
        writer.on_reader_closed(hook);
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_writers_discard_the_hook() {
        let (reader, writer) = new_pipe(4, 2, true);
        let (count, hook) = counter();
        writer.on_reader_closed(hook);
        writer.close();
        drop(reader);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn untargeted_callbacks_are_posted_to_the_fallback() {
        let mut worker = WorkerService::new("pipe-events");
        worker.start().unwrap();
        let (reader, writer) = new_pipe_on(4, 2, true, Arc::new(worker.handle()));
        writer.write(b"ready").unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        reader
            .async_wait(Some(Box::new(move || tx.send(thread::current().id()).unwrap())), WaitFlags::NONE, None)
            .unwrap();
        let delivered_on = rx.recv_timeout(Duration::from_secs(5)).expect("callback");
        assert_ne!(delivered_on, caller);
        worker.shutdown().unwrap();
    }

    #[test]
    fn blocking_readers_wait_for_the_writer() {
        let (reader, writer) = new_pipe(4, 2, false);
        assert!(!reader.is_non_blocking());
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write(b"late").unwrap();
            writer.close();
        });
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Ok(4));
        assert_eq!(reader.read(&mut buf), Ok(0));
        producer.join().unwrap();
    }
}
