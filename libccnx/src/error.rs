use crate::backend::BackendError;
use std::io;
use thiserror::Error;

/// Errors raised by the transport worker when it is asked to run (or start running) work.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("The worker service has not been started, or has been shut down.")]
    NotInitialized,
    #[error("The worker service is shutting down.")]
    ShuttingDown,
    #[error("Could not spawn the worker thread. {0}")]
    Spawn(String),
}

/// Errors that can occur while setting up the connection to the fetch network. These are all terminal: the transport
/// never retries a failed connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("The fetch network is unavailable. {0}")]
    Unavailable(BackendError),
    #[error("'{name}' is not a valid content name. {reason}")]
    InvalidName { name: String, reason: String },
    #[error("Could not open a fetch stream for the content name. {0}")]
    OpenFailed(BackendError),
    #[error("The transport is already connected.")]
    AlreadyConnected,
    #[error("Could not start the transport worker. {0}")]
    Worker(#[from] WorkerError),
}

impl ConnectError {
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError::InvalidName { name: name.into(), reason: reason.into() }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("The transport's input stream has already been opened.")]
    AlreadyOpened,
    #[error("The transport is not connected.")]
    NotConnected,
    #[error("The fetch handle has been released and is no longer available.")]
    NotInitialized,
    #[error("The transport worker rejected the request. {0}")]
    Worker(#[from] WorkerError),
}

/// A failure reported by the fetch library while pumping a stream, after being passed through the fixed code table in
/// [`crate::backend::codes`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("The fetch gave up before any content arrived.")]
    NoContent,
    #[error("The content object could not be decoded.")]
    Malformed,
    #[error("The connection to the forwarder was lost.")]
    Disconnected,
    #[error("The fetch library reported failure code {0}.")]
    Code(i32),
}

/// The status carried by a byte stream.
///
/// With the exception of [`StreamError::WouldBlock`], every variant is *terminal*: once a stream has been closed with
/// one of them, every subsequent read reports the same value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("The stream is closed.")]
    Closed,
    #[error("The stream has no data available right now.")]
    WouldBlock,
    #[error("The stream was aborted.")]
    Aborted,
    #[error("The fetch handle is no longer available.")]
    NotInitialized,
    #[error("The fetch network is unavailable.")]
    ConnectFailure,
    #[error("The content name is invalid.")]
    InvalidName,
    #[error("Fetch protocol error. {0}")]
    Protocol(#[from] ProtocolError),
}

impl StreamError {
    /// Returns true for every status that may close a stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamError::WouldBlock)
    }
}

impl From<&ConnectError> for StreamError {
    fn from(error: &ConnectError) -> Self {
        match error {
            ConnectError::Unavailable(_) | ConnectError::OpenFailed(_) => StreamError::ConnectFailure,
            ConnectError::InvalidName { .. } => StreamError::InvalidName,
            ConnectError::AlreadyConnected => StreamError::Aborted,
            ConnectError::Worker(_) => StreamError::NotInitialized,
        }
    }
}

impl From<&TransportError> for StreamError {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::AlreadyOpened => StreamError::Aborted,
            TransportError::NotConnected | TransportError::NotInitialized | TransportError::Worker(_) => {
                StreamError::NotInitialized
            }
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(error: StreamError) -> Self {
        let kind = match error {
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            StreamError::WouldBlock => io::ErrorKind::WouldBlock,
            StreamError::Aborted => io::ErrorKind::ConnectionAborted,
            StreamError::NotInitialized => io::ErrorKind::NotConnected,
            StreamError::ConnectFailure => io::ErrorKind::ConnectionRefused,
            StreamError::InvalidName => io::ErrorKind::InvalidInput,
            StreamError::Protocol(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error. {0}")]
    Io(#[from] io::Error),
    #[error("Could not parse the configuration file. {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("Could not serialize the configuration. {0}")]
    Serialize(#[from] ron::Error),
    #[error("Invalid configuration. {0}")]
    Invalid(String),
}
