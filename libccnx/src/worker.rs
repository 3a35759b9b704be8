//! The dedicated thread that all blocking fetch work runs on.
//!
//! A [`WorkerService`] owns one thread and a FIFO task queue. It is the only thing allowed to block on the fetch
//! library, which keeps consumer threads (and whatever executor they belong to) responsive. The service itself is the
//! control handle: only its owner can start and stop it. Everyone else holds a cloneable [`WorkerHandle`], which can
//! dispatch tasks but has no say over the thread's lifetime.
//!
//! # Shutdown ordering
//!
//! The run loop only looks at the shutdown flag once the queue is empty, so every task that was accepted (including
//! tasks queued by other tasks while the worker drains) runs before the thread exits. Once shutdown has begun, the
//! worker only accepts tasks from its own thread; everyone else gets [`WorkerError::NotInitialized`] and must treat
//! the stream they were serving as closed.

use crate::error::WorkerError;
use crate::helpers::{lock, wait};
use crate::target::{EventTarget, Task};
use log::*;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Not started yet.
    Idle,
    Running,
    /// Shutdown has been requested and the worker is draining its queue.
    ShuttingDown,
    /// The worker thread has exited.
    Stopped,
}

struct Queue {
    tasks: VecDeque<Task>,
    phase: WorkerPhase,
    thread: Option<ThreadId>,
}

struct WorkerShared {
    name: String,
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

impl WorkerShared {
    fn is_worker_thread(&self, queue: &Queue) -> bool {
        queue.thread == Some(thread::current().id())
    }

    fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        let mut queue = lock(&self.queue);
        let accept = match queue.phase {
            WorkerPhase::Running => true,
            WorkerPhase::ShuttingDown => self.is_worker_thread(&queue),
            WorkerPhase::Idle | WorkerPhase::Stopped => false,
        };
        if !accept {
            trace!("Worker {} refused a task in phase {:?}", self.name, queue.phase);
            return Err(WorkerError::NotInitialized);
        }
        queue.tasks.push_back(task);
        drop(queue);
        self.wakeup.notify_one();
        Ok(())
    }

    fn is_on_worker(&self) -> bool {
        let queue = lock(&self.queue);
        self.is_worker_thread(&queue)
    }

    fn run(&self) {
        debug!("Worker {} started", self.name);
        loop {
            let task = {
                let mut queue = lock(&self.queue);
                loop {
                    if let Some(task) = queue.tasks.pop_front() {
                        break Some(task);
                    }
                    if queue.phase == WorkerPhase::ShuttingDown {
                        break None;
                    }
                    queue = wait(&self.wakeup, queue);
                }
            };
            match task {
                Some(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("A task panicked on worker {}. The worker carries on.", self.name);
                    }
                }
                None => break,
            }
        }
        let mut queue = lock(&self.queue);
        queue.phase = WorkerPhase::Stopped;
        queue.thread = None;
        debug!("Worker {} stopped", self.name);
    }
}

/// Owns the worker thread. See the [module documentation](self).
pub struct WorkerService {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerService {
    /// Creates a service. The thread is not spawned until [`WorkerService::start`] is called.
    pub fn new(name: impl Into<String>) -> Self {
        let queue = Queue { tasks: VecDeque::new(), phase: WorkerPhase::Idle, thread: None };
        let shared = Arc::new(WorkerShared { name: name.into(), queue: Mutex::new(queue), wakeup: Condvar::new() });
        Self { shared, thread: None }
    }

    /// Spawns the worker thread. Starting a running service is a no-op. A stopped service can be started again.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        let mut queue = lock(&self.shared.queue);
        match queue.phase {
            WorkerPhase::Running => return Ok(()),
            WorkerPhase::ShuttingDown => return Err(WorkerError::ShuttingDown),
            WorkerPhase::Idle | WorkerPhase::Stopped => {}
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || shared.run())
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        queue.thread = Some(handle.thread().id());
        queue.phase = WorkerPhase::Running;
        drop(queue);
        // A previous, already stopped thread is reaped here.
        if let Some(old) = self.thread.replace(handle) {
            let _ = old.join();
        }
        Ok(())
    }

    /// Enqueues `task` to run on the worker thread.
    pub fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        self.shared.dispatch(task)
    }

    /// Whether the caller is running on this service's thread.
    pub fn is_on_worker(&self) -> bool {
        self.shared.is_on_worker()
    }

    pub fn phase(&self) -> WorkerPhase {
        lock(&self.shared.queue).phase
    }

    /// A cloneable handle that can dispatch tasks to this service.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { shared: Arc::clone(&self.shared) }
    }

    /// Stops the worker once it has drained its queue, and waits for the thread to exit.
    ///
    /// Shutting down a service that was never started is a no-op, as is shutting down a stopped one. When called from
    /// the worker thread itself (i.e. the service is dropped by one of its own tasks), the flag is set but the thread
    /// is not joined; it exits as soon as the current task and the rest of the queue have run.
    pub fn shutdown(&mut self) -> Result<(), WorkerError> {
        {
            let mut queue = lock(&self.shared.queue);
            match queue.phase {
                WorkerPhase::Idle | WorkerPhase::Stopped => return Ok(()),
                WorkerPhase::ShuttingDown => return Err(WorkerError::ShuttingDown),
                WorkerPhase::Running => queue.phase = WorkerPhase::ShuttingDown,
            }
        }
        self.shared.wakeup.notify_all();
        debug!("Shutting down worker {}", self.shared.name);
        if self.is_on_worker() {
            trace!("Worker {} was shut down from its own thread. Not joining.", self.shared.name);
            return Ok(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Worker {} exited abnormally", self.shared.name);
            }
        }
        Ok(())
    }
}

impl Drop for WorkerService {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            trace!("Worker {} dropped during shutdown: {err}", self.shared.name);
        }
    }
}

impl EventTarget for WorkerService {
    fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        self.shared.dispatch(task)
    }

    fn is_on_current_thread(&self) -> bool {
        self.shared.is_on_worker()
    }
}

/// A dispatch-only handle to a [`WorkerService`]. It cannot start or stop the worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    pub fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        self.shared.dispatch(task)
    }

    pub fn is_on_worker(&self) -> bool {
        self.shared.is_on_worker()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl EventTarget for WorkerHandle {
    fn dispatch(&self, task: Task) -> Result<(), WorkerError> {
        self.shared.dispatch(task)
    }

    fn is_on_current_thread(&self) -> bool {
        self.shared.is_on_worker()
    }
}
