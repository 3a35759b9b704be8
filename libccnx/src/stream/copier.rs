use crate::error::{StreamError, WorkerError};
use crate::stream::{AsyncInputStream, PipeWriter, WaitFlags};
use crate::target::EventTarget;
use crate::worker::WorkerHandle;
use log::*;
use std::sync::Arc;

/// Copies a source stream into a pipe, one chunk per worker task.
///
/// Each step reads at most one chunk (bounded by the free space in the pipe) and then re-queues itself, so other work
/// on the worker interleaves with the copy. When the pipe is full the copier parks until the reader makes room; when
/// the source would block it parks until the source is ready. Closing the pipe's reader aborts the source from the
/// closing thread, which interrupts a read that is still waiting on the network.
pub(crate) struct AsyncCopier {
    source: Arc<dyn AsyncInputStream>,
    sink: PipeWriter,
    worker: WorkerHandle,
    chunk_size: usize,
}

impl AsyncCopier {
    pub fn new(source: Arc<dyn AsyncInputStream>, sink: PipeWriter, worker: WorkerHandle, chunk_size: usize) -> Self {
        Self { source, sink, worker, chunk_size: chunk_size.max(1) }
    }

    pub fn start(self) -> Result<(), WorkerError> {
        let source = Arc::downgrade(&self.source);
        self.sink.on_reader_closed(Box::new(move || {
            if let Some(source) = source.upgrade() {
                debug!("Pipe reader closed. Aborting the copy source.");
                source.close_with_status(StreamError::Aborted);
            }
        }));
        Arc::new(self).schedule()
    }

    fn schedule(self: &Arc<Self>) -> Result<(), WorkerError> {
        let copier = Arc::clone(self);
        self.worker.dispatch(Box::new(move || copier.step()))
    }

    fn target(&self) -> Option<Arc<dyn EventTarget>> {
        Some(Arc::new(self.worker.clone()))
    }

    fn resume(self: &Arc<Self>) -> Box<dyn FnOnce() + Send> {
        let copier = Arc::clone(self);
        Box::new(move || copier.step())
    }

    fn step(self: Arc<Self>) {
        let space = match self.sink.space() {
            Ok(0) => {
                self.sink.async_wait(self.resume(), self.target());
                return;
            }
            Ok(space) => space,
            Err(err) => {
                debug!("Pipe reader went away ({err}). Stopping the copy.");
                self.source.close_with_status(StreamError::Aborted);
                return;
            }
        };
        let mut chunk = vec![0u8; space.min(self.chunk_size)];
        match self.source.read(&mut chunk) {
            Ok(0) => {
                trace!("Copy complete");
                self.sink.close();
                self.source.close();
            }
            Ok(n) => {
                if let Err(err) = self.sink.write(&chunk[..n]) {
                    debug!("Could not write to the pipe ({err}). Stopping the copy.");
                    self.source.close_with_status(StreamError::Aborted);
                    return;
                }
                if let Err(err) = self.schedule() {
                    warn!("Could not continue the copy: {err}");
                    self.source.close_with_status(StreamError::NotInitialized);
                    self.sink.close_with_status(StreamError::NotInitialized);
                }
            }
            Err(StreamError::WouldBlock) => {
                if let Err(err) = self.source.async_wait(Some(self.resume()), WaitFlags::NONE, self.target()) {
                    self.sink.close_with_status(err);
                }
            }
            Err(err) => {
                debug!("Copy source closed: {err}");
                self.sink.close_with_status(err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::new_pipe;
    use crate::worker::WorkerService;
    use std::time::Duration;

    /// A source that hands out a fixed payload, one byte per read, and would block every other read.
    struct Trickle {
        inner: crate::stream::PipeReader,
    }

    impl AsyncInputStream for Trickle {
        fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
            let len = buf.len().min(1);
            self.inner.read(&mut buf[..len])
        }

        fn available(&self) -> Result<usize, StreamError> {
            self.inner.available()
        }

        fn is_non_blocking(&self) -> bool {
            true
        }

        fn close_with_status(&self, reason: StreamError) {
            self.inner.close_with_status(reason)
        }

        fn async_wait(
            &self,
            callback: Option<crate::stream::ReadyCallback>,
            flags: WaitFlags,
            target: Option<Arc<dyn EventTarget>>,
        ) -> Result<(), StreamError> {
            self.inner.async_wait(callback, flags, target)
        }

        fn condition(&self) -> crate::stream::StreamCondition {
            self.inner.condition()
        }
    }

    #[test]
    fn copies_everything_through_a_small_pipe() {
        let mut worker = WorkerService::new("copier-test");
        worker.start().unwrap();
        let (source_reader, source_writer) = new_pipe(64, 1, true);
        let (reader, writer) = new_pipe(2, 2, false);
        let source = Arc::new(Trickle { inner: source_reader });
        AsyncCopier::new(source, writer, worker.handle(), 3).start().unwrap();
        let producer = std::thread::spawn(move || {
            for chunk in [&b"hello "[..], b"world"] {
                source_writer.write(chunk).unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            source_writer.close();
        });
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(err) => panic!("copy failed: {err}"),
            }
        }
        producer.join().unwrap();
        assert_eq!(out, b"hello world");
        worker.shutdown().unwrap();
    }

    #[test]
    fn source_errors_reach_the_pipe() {
        let mut worker = WorkerService::new("copier-test");
        worker.start().unwrap();
        let (source_reader, source_writer) = new_pipe(8, 1, true);
        let (reader, writer) = new_pipe(8, 1, false);
        AsyncCopier::new(Arc::new(source_reader), writer, worker.handle(), 8).start().unwrap();
        source_writer.close_with_status(StreamError::ConnectFailure);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), Err(StreamError::ConnectFailure));
        worker.shutdown().unwrap();
    }

    #[test]
    fn closing_the_pipe_reader_aborts_an_idle_source() {
        let mut worker = WorkerService::new("copier-test");
        worker.start().unwrap();
        let (source_reader, _source_writer) = new_pipe(8, 1, true);
        let source: Arc<dyn AsyncInputStream> = Arc::new(source_reader);
        let (reader, writer) = new_pipe(8, 1, true);
        AsyncCopier::new(Arc::clone(&source), writer, worker.handle(), 8).start().unwrap();
        assert_eq!(source.condition(), crate::stream::StreamCondition::Open);
        drop(reader);
        assert_eq!(source.condition(), crate::stream::StreamCondition::ClosedError(StreamError::Aborted));
        worker.shutdown().unwrap();
    }
}
