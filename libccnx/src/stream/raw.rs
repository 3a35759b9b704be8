use crate::backend::{stream_error_for, FetchBackend, FetchRead};
use crate::error::StreamError;
use crate::helpers::lock;
use crate::stream::{AsyncInputStream, PendingCallback, ReadyCallback, StreamCondition, WaitFlags};
use crate::target::EventTarget;
use crate::transport::{Shared, TransportState};
use bytes::Buf;
use log::*;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread;

/// How much a pull tries to read before handing back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pull {
    /// Fill the buffer, or stop at the first sign that nothing more is buffered.
    Read,
    /// Stop at the first chunk of data. Carries the registration the pull serves.
    Readiness(u64),
}

struct StreamCore<B: FetchBackend> {
    shared: Arc<Shared<B>>,
}

/// The fetch stream of a [`crate::transport::FetchTransport`], exposed as an [`AsyncInputStream`].
///
/// Reads drive the fetch library until data arrives, so they block the calling thread. The transport only ever calls
/// `read` from its worker thread; consumers reach this stream through a pipe. The stream may be cloned. Dropping the
/// last clone closes it and hands its lease on the fetch handle back to the transport.
pub struct AsyncByteStream<B: FetchBackend> {
    core: Arc<StreamCore<B>>,
}

impl<B: FetchBackend> Clone for AsyncByteStream<B> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core) }
    }
}

impl<B: FetchBackend> AsyncByteStream<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>) -> Self {
        trace!("Fetch stream created");
        Self { core: Arc::new(StreamCore { shared }) }
    }

    /// Total bytes handed out by `read` so far.
    pub fn bytes_read(&self) -> u64 {
        lock(&self.core.shared.state).bytes_read
    }
}

impl<B: FetchBackend> StreamCore<B> {
    fn state(&self) -> MutexGuard<'_, TransportState<B>> {
        lock(&self.shared.state)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.pull(buf, Pull::Read)
    }

    /// Runs on the worker for a readiness registration: pulls one chunk into the lookahead buffer and notifies the
    /// registrant.
    fn prefetch(&self, generation: u64) {
        let mut chunk = vec![0u8; self.shared.config.segment_size.max(1)];
        if let Ok(n @ 1..) = self.pull(&mut chunk, Pull::Readiness(generation)) {
            trace!("Fetch stream has {n} bytes ready");
        }
    }

    /// The pull loop. The transport lock is held for one protocol call at a time, so a closer can always get in
    /// between two iterations.
    ///
    /// Lookahead always holds the oldest undelivered bytes. A read drains it before touching the fetch library, and
    /// a readiness pull appends its chunk under the same lock that covered the protocol call.
    fn pull(&self, buf: &mut [u8], mode: Pull) -> Result<usize, StreamError> {
        let shared = &self.shared;
        let backend = shared.backend.as_ref();
        let mut state = self.state();
        let mut lease = None;
        let mut filled = 0;
        let mut notify = None;
        let result = loop {
            if !state.lookahead.is_empty() {
                match mode {
                    Pull::Read if filled == 0 => {
                        let n = buf.len().min(state.lookahead.len());
                        buf[..n].copy_from_slice(&state.lookahead[..n]);
                        state.lookahead.advance(n);
                        break Ok(n);
                    }
                    Pull::Read => break Ok(filled),
                    Pull::Readiness(generation) => {
                        notify = current_waiter(&mut state, generation);
                        break Ok(0);
                    }
                }
            }
            if state.condition.is_closed() {
                break if filled > 0 { Ok(filled) } else { state.condition.read_result() };
            }
            if let Pull::Readiness(generation) = mode {
                if state.generation != generation || state.pending.is_none() {
                    trace!("Readiness pull {generation} was superseded");
                    break Ok(filled);
                }
            }
            if shared.close_requested.load(Ordering::SeqCst) {
                drop(state);
                thread::yield_now();
                state = self.state();
                continue;
            }
            if filled == buf.len() {
                break Ok(filled);
            }
            if lease.is_none() {
                match shared.acquire_locked(&mut state) {
                    Ok(acquired) => lease = Some(acquired),
                    Err(err) => {
                        warn!("Fetch stream read after the fetch handle went away: {err}");
                        notify = shared.close_locked(&mut state, StreamError::NotInitialized);
                        break Err(StreamError::NotInitialized);
                    }
                }
            }
            let Some(session) = state.session.as_mut() else {
                break Err(StreamError::NotInitialized);
            };
            match backend.read(&mut session.stream, &mut buf[filled..]) {
                FetchRead::Data(0) | FetchRead::End => {
                    trace!("Fetch stream reached the end of the content");
                    state.condition = StreamCondition::ClosedNormal;
                    notify = state.pending.take();
                    break Ok(filled);
                }
                FetchRead::Data(n) => {
                    filled += n;
                    if let Pull::Readiness(generation) = mode {
                        state.lookahead.extend_from_slice(&buf[..filled]);
                        notify = current_waiter(&mut state, generation);
                        break Ok(filled);
                    }
                }
                FetchRead::NoDataYet | FetchRead::Timeout if filled > 0 => break Ok(filled),
                outcome @ (FetchRead::NoDataYet | FetchRead::Timeout) => {
                    if outcome == FetchRead::Timeout {
                        trace!("Interest timed out. Re-expressing it");
                        backend.reset_timeout(&mut session.stream);
                    }
                    if let Err(err) = backend.pump_once(&mut session.connection, shared.config.pump_timeout()) {
                        warn!("Fetch library stopped processing: {err}");
                        let err = stream_error_for(err.code());
                        notify = shared.close_locked(&mut state, err.clone());
                        break Err(err);
                    }
                }
                FetchRead::Failed(code) => {
                    let err = stream_error_for(code);
                    debug!("Fetch failed with code {code}: {err}");
                    state.condition = StreamCondition::ClosedError(err.clone());
                    notify = state.pending.take();
                    break if filled > 0 { Ok(filled) } else { Err(err) };
                }
            }
            drop(state);
            state = self.state();
        };
        if let Some(lease) = lease {
            shared.release_locked(&mut state, lease);
        }
        if let (Pull::Read, Ok(n)) = (mode, &result) {
            state.bytes_read += *n as u64;
        }
        drop(state);
        if let Some(pending) = notify {
            pending.deliver(Some(&shared.worker));
        }
        result
    }

    fn async_wait(
        self: &Arc<Self>,
        callback: Option<ReadyCallback>,
        flags: WaitFlags,
        target: Option<Arc<dyn EventTarget>>,
    ) -> Result<(), StreamError> {
        let mut state = self.state();
        state.generation += 1;
        let generation = state.generation;
        let Some(callback) = callback else {
            state.pending = None;
            return Ok(());
        };
        let pending = PendingCallback::new(callback, flags, target);
        let data_ready = !state.lookahead.is_empty() && pending.wants_data();
        if state.condition.is_closed() || data_ready {
            state.pending = None;
            drop(state);
            pending.deliver(Some(&self.shared.worker));
            return Ok(());
        }
        state.pending = Some(pending);
        drop(state);
        if flags.contains(WaitFlags::CLOSURE_ONLY) {
            return Ok(());
        }
        let core = Arc::clone(self);
        if let Err(err) = self.shared.worker.dispatch(Box::new(move || core.prefetch(generation))) {
            warn!("Could not schedule a readiness pull: {err}");
            self.shared.close_with_status(StreamError::NotInitialized);
        }
        Ok(())
    }
}

/// Takes the registration served by readiness pull `generation`, if it is still current and waits for data.
fn current_waiter<B: FetchBackend>(state: &mut TransportState<B>, generation: u64) -> Option<PendingCallback> {
    match state.pending.as_ref() {
        Some(pending) if state.generation == generation && pending.wants_data() => state.pending.take(),
        _ => None,
    }
}

impl<B: FetchBackend> Drop for StreamCore<B> {
    fn drop(&mut self) {
        trace!("Last handle on the fetch stream dropped");
        self.shared.close_with_status(StreamError::Closed);
        self.shared.detach_reader();
    }
}

impl<B: FetchBackend> AsyncInputStream for AsyncByteStream<B> {
    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.core.read(buf)
    }

    fn available(&self) -> Result<usize, StreamError> {
        let state = self.core.state();
        match state.lookahead.len() {
            0 if state.condition.is_closed() => state.condition.read_result(),
            n => Ok(n),
        }
    }

    fn is_non_blocking(&self) -> bool {
        true
    }

    fn close_with_status(&self, reason: StreamError) {
        self.core.shared.close_with_status(reason)
    }

    fn async_wait(
        &self,
        callback: Option<ReadyCallback>,
        flags: WaitFlags,
        target: Option<Arc<dyn EventTarget>>,
    ) -> Result<(), StreamError> {
        self.core.async_wait(callback, flags, target)
    }

    fn condition(&self) -> StreamCondition {
        self.core.state().condition.clone()
    }
}
