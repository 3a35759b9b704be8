//! The fetch library this crate adapts.
//!
//! Everything that speaks the content-centric protocol itself (connecting to the forwarder, encoding interests,
//! reassembling segments) lives behind the [`FetchBackend`] trait. The rest of the crate only ever drives a backend
//! through this interface, and always while holding the owning transport's lock.

#[cfg(feature = "scripted_backend")]
mod scripted;

#[cfg(feature = "scripted_backend")]
pub use scripted::{Scripted, ScriptedFetch, ScriptedStats};

use crate::config::InterestOptions;
use crate::error::{ProtocolError, StreamError};
use crate::name::ContentName;
use std::time::Duration;
use thiserror::Error;

/// Failure codes the fetch library reports through [`FetchRead::Failed`] and [`BackendError::code`].
pub mod codes {
    /// Nothing arrived and the library has stopped waiting.
    pub const READ_NONE: i32 = -2;
    /// A content object arrived but could not be decoded.
    pub const READ_MALFORMED: i32 = -3;
    /// The connection to the forwarder has been lost.
    pub const DISCONNECTED: i32 = -4;
}

/// Translation table from the library's failure codes to protocol errors. Codes not listed here are reported verbatim
/// as [`ProtocolError::Code`].
const FAILURE_TABLE: [(i32, ProtocolError); 3] = [
    (codes::READ_NONE, ProtocolError::NoContent),
    (codes::READ_MALFORMED, ProtocolError::Malformed),
    (codes::DISCONNECTED, ProtocolError::Disconnected),
];

/// Maps a failure code from the fetch library to the terminal status of the stream that observed it.
pub fn stream_error_for(code: i32) -> StreamError {
    let err = FAILURE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, err)| *err)
        .unwrap_or(ProtocolError::Code(code));
    StreamError::Protocol(err)
}

/// The result of a single non-blocking read from a fetch stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchRead {
    /// This many bytes were copied into the buffer.
    Data(usize),
    /// Nothing is buffered yet. The library needs to process more traffic before it can deliver data.
    NoDataYet,
    /// The interest for the next segment timed out. The caller may reset the timeout and keep waiting.
    Timeout,
    /// All the content has been delivered.
    End,
    /// The fetch failed with the given code. See [`codes`].
    Failed(i32),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Fetch library error {code}: {message}")]
pub struct BackendError {
    code: i32,
    message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The capability a content-centric fetch library offers.
///
/// Handles are modelled as associated types that the backend creates and later consumes again when they are destroyed,
/// so a handle can never be used after it has been handed back. None of these methods are called concurrently for the
/// same transport.
pub trait FetchBackend: Send + Sync + 'static {
    /// A connection to the local forwarder.
    type Connection: Send + 'static;
    /// A name resolved into the library's internal representation.
    type Name: Send + 'static;
    /// An interest template built from [`InterestOptions`].
    type Template: Send + 'static;
    /// A stream reassembling the content for one name.
    type Stream: Send + 'static;

    fn connect(&self) -> Result<Self::Connection, BackendError>;

    fn resolve_name(&self, name: &ContentName) -> Result<Self::Name, BackendError>;

    fn make_template(&self, options: &InterestOptions) -> Self::Template;

    fn open_fetch(
        &self,
        connection: &mut Self::Connection,
        name: &Self::Name,
        template: &Self::Template,
        options: &InterestOptions,
    ) -> Result<Self::Stream, BackendError>;

    /// Copies whatever content is buffered into `buf`, without blocking.
    fn read(&self, stream: &mut Self::Stream, buf: &mut [u8]) -> FetchRead;

    /// Restarts the timeout for the outstanding interest after a [`FetchRead::Timeout`].
    fn reset_timeout(&self, stream: &mut Self::Stream);

    /// Runs one iteration of the library's processing loop, waiting at most `timeout` for traffic.
    fn pump_once(&self, connection: &mut Self::Connection, timeout: Duration) -> Result<(), BackendError>;

    fn close_fetch(&self, stream: Self::Stream);

    fn destroy_template(&self, template: Self::Template);

    fn destroy_name(&self, name: Self::Name);

    fn destroy_connection(&self, connection: Self::Connection);
}
