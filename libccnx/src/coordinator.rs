//! Lazily connects a [`FetchTransport`] on first demand and hands its content to a single consumer.
//!
//! A [`StreamCoordinator`] looks like a stream from the start, but does no network I/O until the consumer first waits
//! for it to become ready. At that point it connects the transport, opens its buffered input and forwards the wait to
//! the resulting pipe. Connection failures are reported as a closed stream carrying the failure.
//!
//! Callbacks registered without a target run on the transport's worker thread, never inside `async_wait` itself.

use crate::backend::FetchBackend;
use crate::config::FetchConfig;
use crate::error::StreamError;
use crate::helpers::lock;
use crate::stream::{AsyncInputStream, OpenFlags, PendingCallback, ReadyCallback, StreamCondition, WaitFlags};
use crate::target::EventTarget;
use crate::transport::FetchTransport;
use crate::worker::WorkerHandle;
use log::*;
use std::sync::{Arc, Mutex, MutexGuard};

/// The lifecycle of a [`StreamCoordinator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing has been asked of the coordinator yet.
    Init,
    Connecting,
    /// Content is flowing from the transport into the data stream.
    Connected,
    /// The transport could not be connected.
    Error,
}

struct CoreState<B: FetchBackend> {
    phase: CoordinatorState,
    transport: Option<FetchTransport<B>>,
    data_stream: Option<Arc<dyn AsyncInputStream>>,
    status: StreamCondition,
    waiter: Option<PendingCallback>,
}

struct Inner<B: FetchBackend> {
    name: String,
    flags: OpenFlags,
    /// The transport's worker. Untargeted callbacks are posted here.
    worker: WorkerHandle,
    state: Mutex<CoreState<B>>,
}

/// See the [module documentation](self).
pub struct StreamCoordinator<B: FetchBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: FetchBackend> StreamCoordinator<B> {
    pub fn new(backend: Arc<B>, config: FetchConfig, name: impl Into<String>) -> Self {
        Self::with_flags(backend, config, name, OpenFlags::NONE)
    }

    /// A coordinator that opens the transport's input with `flags`. Unbuffered flags are ignored: the coordinator
    /// always reads through a pipe.
    pub fn with_flags(backend: Arc<B>, config: FetchConfig, name: impl Into<String>, flags: OpenFlags) -> Self {
        let name = name.into();
        let flags = if flags.is_buffered() { flags } else { OpenFlags::NONE };
        trace!("Coordinator created for {name}");
        let transport = FetchTransport::new(backend, config);
        let worker = transport.worker();
        let state = CoreState {
            phase: CoordinatorState::Init,
            transport: Some(transport),
            data_stream: None,
            status: StreamCondition::Open,
            waiter: None,
        };
        let inner = Inner { name, flags, worker, state: Mutex::new(state) };
        Self { inner: Arc::new(inner) }
    }

    pub fn phase(&self) -> CoordinatorState {
        self.inner.state().phase
    }

    /// The status of the coordinator, or of its data stream once it is connected.
    pub fn status(&self) -> StreamCondition {
        let (status, data_stream) = {
            let state = self.inner.state();
            (state.status.clone(), state.data_stream.clone())
        };
        match (status, data_stream) {
            (StreamCondition::Open, Some(stream)) => stream.condition(),
            (status, _) => status,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status().is_closed()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<B: FetchBackend> Inner<B> {
    fn state(&self) -> MutexGuard<'_, CoreState<B>> {
        lock(&self.state)
    }

    /// Connects the transport and opens its input. Runs without holding the coordinator lock.
    fn connect(&self, transport: &mut FetchTransport<B>) -> Result<Arc<dyn AsyncInputStream>, StreamError> {
        if let Err(err) = transport.connect(&self.name) {
            warn!("Could not connect to {}: {err}", self.name);
            return Err(StreamError::from(&err));
        }
        transport.open_input(self.flags, 0, 0).map_err(|err| {
            warn!("Could not open the input for {}: {err}", self.name);
            StreamError::from(&err)
        })
    }

    fn on_callback_pending(self: &Arc<Self>) {
        let mut state = self.state();
        match state.phase {
            CoordinatorState::Init => {
                let Some(mut transport) = state.transport.take() else {
                    return;
                };
                state.phase = CoordinatorState::Connecting;
                drop(state);
                debug!("Connecting to {}", self.name);
                let result = self.connect(&mut transport);
                self.on_connected(transport, result);
            }
            CoordinatorState::Connected => {
                drop(state);
                self.forward_wait();
            }
            // The connecting thread forwards the wait once it is done. Errors are reported as soon as they happen.
            CoordinatorState::Connecting | CoordinatorState::Error => {}
        }
    }

    /// Takes the transport back after connecting. It stays with the coordinator even when connecting failed, so its
    /// worker outlives every callback the coordinator may still have to post.
    fn on_connected(
        self: &Arc<Self>,
        transport: FetchTransport<B>,
        result: Result<Arc<dyn AsyncInputStream>, StreamError>,
    ) {
        let mut state = self.state();
        match result {
            Ok(stream) if state.status.is_closed() => {
                debug!("Coordinator for {} was closed while connecting", self.name);
                state.phase = CoordinatorState::Connected;
                drop(state);
                transport.close(Some(StreamError::Aborted));
                stream.close();
                self.state().transport = Some(transport);
            }
            Ok(stream) => {
                debug!("Connected to {}", self.name);
                state.phase = CoordinatorState::Connected;
                state.transport = Some(transport);
                state.data_stream = Some(stream);
                drop(state);
                self.forward_wait();
            }
            Err(err) => {
                state.phase = CoordinatorState::Error;
                state.transport = Some(transport);
                let waiter = if state.status.is_closed() {
                    None
                } else {
                    state.status = StreamCondition::from_reason(err);
                    state.waiter.take()
                };
                drop(state);
                self.notify(waiter);
            }
        }
    }

    fn notify(&self, waiter: Option<PendingCallback>) {
        if let Some(waiter) = waiter {
            waiter.deliver(Some(&self.worker));
        }
    }

    /// Re-issues the consumer's registration against the data stream. The consumer's callback is kept here and
    /// invoked by a forwarder, so it can still be cancelled or replaced through the coordinator.
    fn forward_wait(self: &Arc<Self>) {
        let (stream, flags, target) = {
            let state = self.state();
            let Some(stream) = state.data_stream.clone() else {
                return;
            };
            match state.waiter.as_ref() {
                Some(waiter) => (stream, waiter.flags, waiter.target.clone()),
                None => return,
            }
        };
        let inner = Arc::clone(self);
        let forwarder: ReadyCallback = Box::new(move || inner.on_stream_ready());
        if let Err(err) = stream.async_wait(Some(forwarder), flags, target) {
            warn!("Could not wait on the data stream for {}: {err}", self.name);
            self.close_with_status(err);
        }
    }

    /// Runs on the consumer's target once the data stream is ready.
    fn on_stream_ready(&self) {
        let waiter = self.state().waiter.take();
        if let Some(waiter) = waiter {
            (waiter.callback)();
        }
    }

    fn close_with_status(&self, reason: StreamError) {
        let (transport, data_stream, waiter) = {
            let mut state = self.state();
            if state.status.is_closed() {
                return;
            }
            state.status = StreamCondition::from_reason(reason.clone());
            debug!("Coordinator for {} closed: {:?}", self.name, state.status);
            (state.transport.take(), state.data_stream.take(), state.waiter.take())
        };
        if let Some(stream) = data_stream {
            stream.close_with_status(reason);
        }
        if let Some(transport) = transport {
            transport.close(Some(StreamError::Aborted));
            self.state().transport = Some(transport);
        }
        self.notify(waiter);
    }
}

impl<B: FetchBackend> AsyncInputStream for StreamCoordinator<B> {
    /// Reads from the data stream. Before the transport is connected there is nothing to read yet.
    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let (status, data_stream) = {
            let state = self.inner.state();
            (state.status.clone(), state.data_stream.clone())
        };
        match data_stream {
            Some(stream) => stream.read(buf),
            None => status.read_result(),
        }
    }

    fn available(&self) -> Result<usize, StreamError> {
        let (status, data_stream) = {
            let state = self.inner.state();
            (state.status.clone(), state.data_stream.clone())
        };
        match (data_stream, status) {
            (Some(stream), _) => stream.available(),
            (None, StreamCondition::Open) => Ok(0),
            (None, status) => status.read_result(),
        }
    }

    fn is_non_blocking(&self) -> bool {
        !self.inner.flags.contains(OpenFlags::BLOCKING)
    }

    fn close_with_status(&self, reason: StreamError) {
        self.inner.close_with_status(reason)
    }

    /// Registers the consumer's callback. The first registration triggers the connection to the transport.
    fn async_wait(
        &self,
        callback: Option<ReadyCallback>,
        flags: WaitFlags,
        target: Option<Arc<dyn EventTarget>>,
    ) -> Result<(), StreamError> {
        let mut state = self.inner.state();
        let Some(callback) = callback else {
            state.waiter = None;
            let data_stream = state.data_stream.clone();
            drop(state);
            if let Some(stream) = data_stream {
                stream.async_wait(None, flags, None)?;
            }
            return Ok(());
        };
        if let Some(transport) = state.transport.as_ref() {
            if let Err(err) = transport.start_worker() {
                warn!("Could not start the worker for {}: {err}", self.inner.name);
            }
        }
        let waiter = PendingCallback::new(callback, flags, target);
        if state.status.is_closed() {
            state.waiter = None;
            drop(state);
            self.inner.notify(Some(waiter));
            return Ok(());
        }
        state.waiter = Some(waiter);
        drop(state);
        self.inner.on_callback_pending();
        Ok(())
    }

    fn condition(&self) -> StreamCondition {
        self.status()
    }
}

impl<B: FetchBackend> Drop for StreamCoordinator<B> {
    fn drop(&mut self) {
        self.inner.close_with_status(StreamError::Closed);
    }
}

#[cfg(all(test, feature = "scripted_backend"))]
mod test {
    use super::*;
    use crate::backend::{Scripted, ScriptedFetch};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn coordinator(fetch: &Arc<ScriptedFetch>, name: &str) -> StreamCoordinator<ScriptedFetch> {
        StreamCoordinator::new(Arc::clone(fetch), FetchConfig::default(), name)
    }

    fn idle(fetch: ScriptedFetch) -> (Arc<ScriptedFetch>, FetchConfig) {
        let fetch = fetch.idle_with(Scripted::NoDataYet).with_pump_delay(Duration::from_millis(5));
        (Arc::new(fetch), FetchConfig { pump_timeout_ms: 5, ..FetchConfig::default() })
    }

    /// Waits for readiness and checks the callback ran on some other thread.
    fn wait_ready(coordinator: &StreamCoordinator<ScriptedFetch>) {
        let (tx, rx) = mpsc::channel();
        let callback = Box::new(move || tx.send(thread::current().id()).unwrap());
        coordinator.async_wait(Some(callback), WaitFlags::NONE, None).unwrap();
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).expect("readiness callback");
        assert_ne!(ran_on, thread::current().id());
    }

    #[test]
    fn construction_does_no_io() {
        let fetch = Arc::new(ScriptedFetch::serving(b"abc", 3));
        let coordinator = coordinator(&fetch, "/lazy");
        assert_eq!(coordinator.phase(), CoordinatorState::Init);
        let mut buf = [0u8; 4];
        assert_eq!(coordinator.read(&mut buf), Err(StreamError::WouldBlock));
        assert_eq!(coordinator.available(), Ok(0));
        assert_eq!(fetch.stats().connects, 0);
        assert!(coordinator.is_non_blocking());
    }

    #[test]
    fn the_first_wait_connects() {
        env_logger::try_init().ok();
        let fetch = Arc::new(ScriptedFetch::serving(b"lazy content", 5));
        let coordinator = coordinator(&fetch, "ccnx:/lazy");
        wait_ready(&coordinator);
        assert_eq!(coordinator.phase(), CoordinatorState::Connected);
        assert_eq!(fetch.stats().connects, 1);
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            match coordinator.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(StreamError::WouldBlock) => wait_ready(&coordinator),
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(out, b"lazy content");
        assert_eq!(coordinator.status(), StreamCondition::ClosedNormal);
    }

    #[test]
    fn connection_failures_close_the_coordinator() {
        let fetch = Arc::new(ScriptedFetch::new().unavailable());
        let coordinator = coordinator(&fetch, "/nowhere");
        wait_ready(&coordinator);
        assert_eq!(coordinator.phase(), CoordinatorState::Error);
        assert_eq!(coordinator.status(), StreamCondition::ClosedError(StreamError::ConnectFailure));
        let mut buf = [0u8; 4];
        assert_eq!(coordinator.read(&mut buf), Err(StreamError::ConnectFailure));
        // Later registrations are told straight away.
        wait_ready(&coordinator);
    }

    #[test]
    fn invalid_names_are_reported() {
        let fetch = Arc::new(ScriptedFetch::new());
        let coordinator = coordinator(&fetch, "not a name");
        wait_ready(&coordinator);
        assert_eq!(coordinator.status(), StreamCondition::ClosedError(StreamError::InvalidName));
        assert_eq!(fetch.stats().connects, 0);
    }

    #[test]
    fn closed_coordinators_never_run_callbacks_inside_async_wait() {
        let fetch = Arc::new(ScriptedFetch::new());
        let coordinator = coordinator(&fetch, "/closed");
        coordinator.close_with_status(StreamError::Aborted);
        wait_ready(&coordinator);
        wait_ready(&coordinator);
        assert_eq!(fetch.stats().connects, 0);
    }

    #[test]
    fn closing_aborts_the_transport() {
        let (fetch, config) = idle(ScriptedFetch::new());
        let coordinator = StreamCoordinator::new(Arc::clone(&fetch), config, "/slow");
        let (tx, rx) = mpsc::channel();
        coordinator.async_wait(Some(Box::new(move || tx.send(()).unwrap())), WaitFlags::NONE, None).unwrap();
        assert_eq!(coordinator.phase(), CoordinatorState::Connected);
        coordinator.close();
        rx.recv_timeout(Duration::from_secs(5)).expect("close notification");
        assert!(coordinator.is_closed());
        assert_eq!(coordinator.status(), StreamCondition::ClosedNormal);
        let mut buf = [0u8; 4];
        assert_eq!(coordinator.read(&mut buf), Ok(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        while fetch.stats().fetch_closes == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fetch.stats().fetch_closes, 1);
    }

    #[test]
    fn cancelled_waits_never_fire() {
        let (fetch, config) = idle(ScriptedFetch::new());
        let coordinator = StreamCoordinator::new(Arc::clone(&fetch), config, "/quiet");
        let (tx, rx) = mpsc::channel();
        coordinator.async_wait(Some(Box::new(move || tx.send(()).unwrap())), WaitFlags::NONE, None).unwrap();
        coordinator.async_wait(None, WaitFlags::NONE, None).unwrap();
        fetch.push(Scripted::Data(b"late".to_vec()));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
