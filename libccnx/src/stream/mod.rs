//! Non-blocking byte streams and the readiness model they share.
//!
//! Every stream in this crate implements [`AsyncInputStream`]: reads never block the caller unless the stream says so
//! via [`AsyncInputStream::is_non_blocking`], and a caller that got [`StreamError::WouldBlock`] registers a one-shot
//! readiness callback with [`AsyncInputStream::async_wait`] instead of polling.

mod copier;
mod pipe;
mod raw;
mod reader;

pub(crate) use copier::AsyncCopier;
pub(crate) use pipe::new_pipe_on;
pub use pipe::{new_pipe, PipeReader, PipeWriter};
pub use raw::AsyncByteStream;
pub use reader::ContentReader;

use crate::error::StreamError;
use crate::target::{post, EventTarget, Task};
use log::*;
use std::fmt::{self, Debug, Formatter};
use std::ops::BitOr;
use std::sync::Arc;

/// A one-shot readiness notification.
pub type ReadyCallback = Task;

/// Flags for [`AsyncInputStream::async_wait`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitFlags(u32);

impl WaitFlags {
    pub const NONE: WaitFlags = WaitFlags(0);
    /// Only notify when the stream closes, not when data becomes available.
    pub const CLOSURE_ONLY: WaitFlags = WaitFlags(1);

    pub fn contains(self, other: WaitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WaitFlags {
    type Output = WaitFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        WaitFlags(self.0 | rhs.0)
    }
}

/// Flags for [`crate::transport::FetchTransport::open_input`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags(0);
    /// Hand out the raw fetch stream instead of a buffering pipe. Ignored when combined with [`OpenFlags::BLOCKING`].
    pub const UNBUFFERED: OpenFlags = OpenFlags(1);
    /// Reads on the returned pipe block until data arrives instead of returning [`StreamError::WouldBlock`].
    pub const BLOCKING: OpenFlags = OpenFlags(2);

    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether content is copied through a pipe.
    pub fn is_buffered(self) -> bool {
        !self.contains(OpenFlags::UNBUFFERED) || self.contains(OpenFlags::BLOCKING)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        OpenFlags(self.0 | rhs.0)
    }
}

/// The lifecycle of a stream. Once closed, a stream never reopens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StreamCondition {
    #[default]
    Open,
    /// All the content was delivered, or the stream was closed with [`StreamError::Closed`].
    ClosedNormal,
    ClosedError(StreamError),
}

impl StreamCondition {
    /// The condition a stream closed with `reason` ends up in.
    pub fn from_reason(reason: StreamError) -> Self {
        match reason {
            StreamError::Closed => StreamCondition::ClosedNormal,
            StreamError::WouldBlock => {
                warn!("A stream cannot be closed with a transient status. Treating it as an abort.");
                StreamCondition::ClosedError(StreamError::Aborted)
            }
            err => StreamCondition::ClosedError(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, StreamCondition::Open)
    }

    /// What a read on a stream in this condition returns when there is nothing left to hand out.
    pub fn read_result(&self) -> Result<usize, StreamError> {
        match self {
            StreamCondition::Open => Err(StreamError::WouldBlock),
            StreamCondition::ClosedNormal => Ok(0),
            StreamCondition::ClosedError(err) => Err(err.clone()),
        }
    }

    /// The status a writer sees when the other end of the stream has gone away.
    pub(crate) fn write_error(&self) -> StreamError {
        match self {
            StreamCondition::Open => StreamError::WouldBlock,
            StreamCondition::ClosedNormal => StreamError::Closed,
            StreamCondition::ClosedError(err) => err.clone(),
        }
    }
}

/// A byte stream that can be read without blocking, and waited on.
pub trait AsyncInputStream: Send + Sync {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means the content ended normally.
    fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError>;

    /// The number of bytes that can be read right now without waiting.
    fn available(&self) -> Result<usize, StreamError>;

    fn is_non_blocking(&self) -> bool;

    fn close(&self) {
        self.close_with_status(StreamError::Closed)
    }

    /// Closes the stream with `reason`. Only the first close has any effect.
    fn close_with_status(&self, reason: StreamError);

    /// Registers `callback` to run once, as soon as data can be read or the stream has closed. The callback runs on
    /// `target` when one is given.
    ///
    /// There is at most one registration per stream. A new registration replaces the previous one, and `None` cancels
    /// it.
    fn async_wait(
        &self,
        callback: Option<ReadyCallback>,
        flags: WaitFlags,
        target: Option<Arc<dyn EventTarget>>,
    ) -> Result<(), StreamError>;

    fn condition(&self) -> StreamCondition;
}

/// A registered readiness callback.
pub(crate) struct PendingCallback {
    pub callback: ReadyCallback,
    pub flags: WaitFlags,
    pub target: Option<Arc<dyn EventTarget>>,
}

impl PendingCallback {
    pub fn new(callback: ReadyCallback, flags: WaitFlags, target: Option<Arc<dyn EventTarget>>) -> Self {
        Self { callback, flags, target }
    }

    /// Whether the callback is waiting for data, rather than only for closure.
    pub fn wants_data(&self) -> bool {
        !self.flags.contains(WaitFlags::CLOSURE_ONLY)
    }

    /// Runs the callback on its target. Without one it runs on `fallback`, or in place if there is no fallback either.
    pub fn deliver(self, fallback: Option<&dyn EventTarget>) {
        match (self.target, fallback) {
            (Some(target), _) => post(target.as_ref(), self.callback),
            (None, Some(fallback)) => post(fallback, self.callback),
            (None, None) => (self.callback)(),
        }
    }
}

impl Debug for PendingCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCallback")
            .field("flags", &self.flags)
            .field("target", &self.target.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_flags() {
        assert!(OpenFlags::NONE.is_buffered());
        assert!(!OpenFlags::UNBUFFERED.is_buffered());
        assert!((OpenFlags::UNBUFFERED | OpenFlags::BLOCKING).is_buffered());
        assert!(OpenFlags::BLOCKING.contains(OpenFlags::NONE));
    }

    #[test]
    fn closing_reasons() {
        assert_eq!(StreamCondition::from_reason(StreamError::Closed), StreamCondition::ClosedNormal);
        let aborted = StreamCondition::ClosedError(StreamError::Aborted);
        assert_eq!(StreamCondition::from_reason(StreamError::WouldBlock), aborted);
        let cond = StreamCondition::from_reason(StreamError::InvalidName);
        assert_eq!(cond.read_result(), Err(StreamError::InvalidName));
        assert_eq!(StreamCondition::ClosedNormal.read_result(), Ok(0));
        assert_eq!(StreamCondition::Open.read_result(), Err(StreamError::WouldBlock));
    }

    #[test]
    fn callbacks_without_a_target_run_in_place() {
        let (tx, rx) = std::sync::mpsc::channel();
        let pending = PendingCallback::new(Box::new(move || tx.send(()).unwrap()), WaitFlags::NONE, None);
        assert!(pending.wants_data());
        pending.deliver(None);
        assert!(rx.try_recv().is_ok());
    }
}
