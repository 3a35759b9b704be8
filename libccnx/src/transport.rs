//! The connection to the fetch network for a single content name.
//!
//! A [`FetchTransport`] owns everything the fetch library hands out for one name: the connection to the forwarder, the
//! resolved name, the interest template and the fetch stream. These live together in a session that is only ever
//! touched while holding the transport's lock. Access to the session is counted with [`HandleLease`]s; the session is
//! torn down exactly once, when the last lease is released.
//!
//! The transport also owns the worker thread that every blocking fetch operation runs on. Streams share the
//! transport's state, so the worker stays alive for as long as any stream produced by the transport does.

use crate::backend::FetchBackend;
use crate::config::FetchConfig;
use crate::error::{ConnectError, StreamError, TransportError, WorkerError};
use crate::helpers::lock;
use crate::name::ContentName;
use crate::stream::{
    new_pipe_on, AsyncByteStream, AsyncCopier, AsyncInputStream, OpenFlags, PendingCallback, StreamCondition,
};
use crate::worker::{WorkerHandle, WorkerService};
use bytes::BytesMut;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Proof that the holder has been counted as a user of a transport's fetch handle.
///
/// Leases are handed back with [`FetchTransport::release_handle`]. A lease that is dropped instead is never counted
/// back, which keeps the handle alive until the transport itself goes away.
#[must_use = "leases must be released, or the fetch handle lives until the transport is dropped"]
#[derive(Debug)]
pub struct HandleLease {
    owner: usize,
}

pub(crate) struct Session<B: FetchBackend> {
    pub connection: B::Connection,
    pub name: B::Name,
    pub template: B::Template,
    pub stream: B::Stream,
}

impl<B: FetchBackend> Session<B> {
    /// Hands every handle back to the backend, the stream first and the connection last.
    fn destroy(self, backend: &B) {
        debug!("Tearing down the fetch session");
        backend.close_fetch(self.stream);
        backend.destroy_template(self.template);
        backend.destroy_name(self.name);
        backend.destroy_connection(self.connection);
    }
}

/// Everything guarded by the transport lock.
pub(crate) struct TransportState<B: FetchBackend> {
    pub session: Option<Session<B>>,
    refs: usize,
    reader_lease: Option<HandleLease>,
    pub condition: StreamCondition,
    pub pending: Option<PendingCallback>,
    /// Bumped on every readiness registration, so stale background pulls can tell they have been superseded.
    pub generation: u64,
    /// Content pulled ahead of the reader by a readiness pull.
    pub lookahead: BytesMut,
    pub bytes_read: u64,
}

/// State shared between a transport and the streams it produces.
pub(crate) struct Shared<B: FetchBackend> {
    pub backend: Arc<B>,
    pub config: FetchConfig,
    pub state: Mutex<TransportState<B>>,
    /// Set as soon as someone wants to close the stream, so in-flight reads step aside for the closer.
    pub close_requested: AtomicBool,
    pub worker: WorkerHandle,
    service: Mutex<WorkerService>,
}

impl<B: FetchBackend> Shared<B> {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    pub fn acquire_locked(self: &Arc<Self>, state: &mut TransportState<B>) -> Result<HandleLease, TransportError> {
        if state.session.is_none() {
            return Err(TransportError::NotInitialized);
        }
        state.refs += 1;
        trace!("Fetch handle acquired. {} lease(s) outstanding", state.refs);
        Ok(HandleLease { owner: self.id() })
    }

    pub fn release_locked(self: &Arc<Self>, state: &mut TransportState<B>, lease: HandleLease) {
        if lease.owner != self.id() {
            error!("A lease from another transport was handed back. Ignoring it.");
            return;
        }
        state.refs = state.refs.saturating_sub(1);
        trace!("Fetch handle released. {} lease(s) outstanding", state.refs);
        if state.refs == 0 {
            self.teardown(state);
        }
    }

    fn teardown(&self, state: &mut TransportState<B>) {
        if let Some(session) = state.session.take() {
            session.destroy(self.backend.as_ref());
        }
    }

    /// Closes the stream. Returns the registered callback, if the close made it due.
    pub fn close_locked(&self, state: &mut TransportState<B>, reason: StreamError) -> Option<PendingCallback> {
        if state.condition.is_closed() {
            return None;
        }
        state.condition = StreamCondition::from_reason(reason);
        state.lookahead.clear();
        debug!("Fetch stream closed: {:?}", state.condition);
        state.pending.take()
    }

    pub fn close_with_status(&self, reason: StreamError) {
        self.close_requested.store(true, Ordering::SeqCst);
        let notify = {
            let mut state = lock(&self.state);
            self.close_locked(&mut state, reason)
        };
        if let Some(pending) = notify {
            pending.deliver(Some(&self.worker));
        }
    }

    /// Releases the reader's lease, if it has not been released already.
    pub fn detach_reader(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if let Some(lease) = state.reader_lease.take() {
            self.release_locked(&mut state, lease);
        }
    }
}

impl<B: FetchBackend> Drop for Shared<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.session.is_some() {
            trace!("Transport dropped with {} lease(s) outstanding", state.refs);
        }
        if let Some(session) = state.session.take() {
            session.destroy(self.backend.as_ref());
        }
    }
}

/// A connection to the fetch network for one content name, and the single input stream reading it.
pub struct FetchTransport<B: FetchBackend> {
    shared: Arc<Shared<B>>,
    name: Option<ContentName>,
    opened: bool,
    input: Option<Weak<dyn AsyncInputStream>>,
}

impl<B: FetchBackend> FetchTransport<B> {
    /// Creates a disconnected transport. No network I/O happens, and the worker is not started, until
    /// [`FetchTransport::connect`].
    pub fn new(backend: Arc<B>, config: FetchConfig) -> Self {
        let service = WorkerService::new(config.worker_name.clone());
        let state = TransportState {
            session: None,
            refs: 0,
            reader_lease: None,
            condition: StreamCondition::Open,
            pending: None,
            generation: 0,
            lookahead: BytesMut::new(),
            bytes_read: 0,
        };
        let shared = Shared {
            backend,
            config,
            state: Mutex::new(state),
            close_requested: AtomicBool::new(false),
            worker: service.handle(),
            service: Mutex::new(service),
        };
        Self { shared: Arc::new(shared), name: None, opened: false, input: None }
    }

    /// Connects to the fetch network and opens a fetch stream for `name`.
    ///
    /// Failures are terminal. Whatever was set up before the failing step is handed back to the backend.
    pub fn connect(&mut self, name: &str) -> Result<(), ConnectError> {
        if self.name.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        let content = ContentName::parse(name).map_err(|e| ConnectError::invalid_name(e.name(), e.reason()))?;
        lock(&self.shared.service).start()?;
        let backend = &self.shared.backend;
        let options = &self.shared.config.interest;
        let mut connection = backend.connect().map_err(ConnectError::Unavailable)?;
        let resolved = match backend.resolve_name(&content) {
            Ok(resolved) => resolved,
            Err(err) => {
                backend.destroy_connection(connection);
                return Err(ConnectError::invalid_name(content.as_str(), err.message()));
            }
        };
        let template = backend.make_template(options);
        let stream = match backend.open_fetch(&mut connection, &resolved, &template, options) {
            Ok(stream) => stream,
            Err(err) => {
                backend.destroy_template(template);
                backend.destroy_name(resolved);
                backend.destroy_connection(connection);
                return Err(ConnectError::OpenFailed(err));
            }
        };
        lock(&self.shared.state).session = Some(Session { connection, name: resolved, template, stream });
        debug!("Connected to the fetch network for {content}");
        self.name = Some(content);
        Ok(())
    }

    /// Opens the transport's input stream. This can be done once per transport.
    ///
    /// Unless [`OpenFlags::UNBUFFERED`] is given without [`OpenFlags::BLOCKING`], the fetched content is copied on the
    /// worker thread into a pipe of `segment_count` segments of `segment_size` bytes, and the pipe's readable end is
    /// returned. A zero size or count selects the configured default.
    pub fn open_input(
        &mut self,
        flags: OpenFlags,
        segment_size: usize,
        segment_count: usize,
    ) -> Result<Arc<dyn AsyncInputStream>, TransportError> {
        if self.opened {
            return Err(TransportError::AlreadyOpened);
        }
        if self.name.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.opened = true;
        {
            let mut state = lock(&self.shared.state);
            let lease = self.shared.acquire_locked(&mut state)?;
            state.reader_lease = Some(lease);
        }
        let raw = Arc::new(AsyncByteStream::new(Arc::clone(&self.shared)));
        if !flags.is_buffered() {
            trace!("Handing out the raw fetch stream");
            let raw: Arc<dyn AsyncInputStream> = raw;
            self.input = Some(Arc::downgrade(&raw));
            return Ok(raw);
        }
        let (size, count) = self.shared.config.resolve_segments(segment_size, segment_count);
        let blocking = flags.contains(OpenFlags::BLOCKING);
        trace!("Buffering the fetch stream through a {count}x{size} byte pipe (blocking: {blocking})");
        let (reader, writer) = new_pipe_on(size, count, !blocking, Arc::new(self.shared.worker.clone()));
        let copier = AsyncCopier::new(raw.clone(), writer, self.shared.worker.clone(), size);
        if let Err(err) = copier.start() {
            warn!("Could not start copying the fetch stream: {err}");
            raw.close_with_status(StreamError::NotInitialized);
            return Err(err.into());
        }
        let reader: Arc<dyn AsyncInputStream> = Arc::new(reader);
        self.input = Some(Arc::downgrade(&reader));
        Ok(reader)
    }

    /// Closes the input stream with `reason` (a normal close when `None`) and releases the reader's handle lease.
    pub fn close(&self, reason: Option<StreamError>) {
        let reason = reason.unwrap_or(StreamError::Closed);
        debug!("Closing the transport: {reason}");
        self.shared.close_with_status(reason);
        self.shared.detach_reader();
    }

    /// Counts the caller as a user of the fetch handle.
    pub fn acquire_handle(&self) -> Result<HandleLease, TransportError> {
        let mut state = lock(&self.shared.state);
        self.shared.acquire_locked(&mut state)
    }

    /// Hands a lease back. Releasing the last lease tears the fetch session down.
    pub fn release_handle(&self, lease: HandleLease) {
        let mut state = lock(&self.shared.state);
        self.shared.release_locked(&mut state, lease);
    }

    /// The number of outstanding handle leases.
    pub fn handle_refs(&self) -> usize {
        lock(&self.shared.state).refs
    }

    /// Whether the fetch session is still alive.
    pub fn is_online(&self) -> bool {
        lock(&self.shared.state).session.is_some()
    }

    pub fn name(&self) -> Option<&ContentName> {
        self.name.as_ref()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.shared.config
    }

    pub fn worker(&self) -> WorkerHandle {
        self.shared.worker.clone()
    }

    /// Starts the worker thread without connecting, so callbacks can be posted to [`FetchTransport::worker`] before
    /// (or without) a successful [`FetchTransport::connect`].
    pub fn start_worker(&self) -> Result<(), WorkerError> {
        lock(&self.shared.service).start()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared<B>> {
        &self.shared
    }
}

impl<B: FetchBackend> Drop for FetchTransport<B> {
    fn drop(&mut self) {
        if !self.opened {
            return;
        }
        // The stream's own drop has closed it already unless a consumer still holds it.
        if self.input.as_ref().and_then(Weak::upgrade).is_none() {
            self.close(Some(StreamError::Aborted));
        }
    }
}
