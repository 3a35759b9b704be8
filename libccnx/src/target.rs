//! Execution contexts that readiness callbacks can be delivered on.

use crate::error::WorkerError;
use crate::helpers::lock;
use log::*;
use std::sync::{Arc, Mutex};

/// A unit of work posted to an [`EventTarget`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a [`Task`] on some other thread, later.
pub trait EventTarget: Send + Sync {
    fn dispatch(&self, task: Task) -> Result<(), WorkerError>;

    /// Whether the calling thread is one this target runs its tasks on.
    fn is_on_current_thread(&self) -> bool;
}

/// Delivers callbacks onto a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioTarget {
    handle: tokio::runtime::Handle,
}

impl TokioTarget {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// A target for the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl EventTarget for TokioTarget {
    fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        self.handle.spawn(async move { task() });
        Ok(())
    }

    /// Runtime worker threads are shared with unrelated tasks, so callers are never treated as being "on" the target.
    fn is_on_current_thread(&self) -> bool {
        false
    }
}

/// Runs `callback` on `target`.
///
/// If the target refuses the task, the callback runs on the calling thread instead: dropping a readiness callback
/// would leave its consumer waiting forever.
pub(crate) fn post(target: &dyn EventTarget, callback: Task) {
    let slot = Arc::new(Mutex::new(Some(callback)));
    let posted = Arc::clone(&slot);
    let result = target.dispatch(Box::new(move || {
        let callback = lock(&posted).take();
        if let Some(callback) = callback {
            callback();
        }
    }));
    if let Err(err) = result {
        warn!("Could not post a callback to its target ({err}). Running it in place.");
        let callback = lock(&slot).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
