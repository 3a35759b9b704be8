pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod name;
pub mod stream;
pub mod target;
pub mod transport;
pub mod worker;

mod helpers;

pub use config::{FetchConfig, InterestOptions};
pub use coordinator::{CoordinatorState, StreamCoordinator};
pub use error::{ConfigError, ConnectError, ProtocolError, StreamError, TransportError, WorkerError};
pub use name::ContentName;
pub use stream::{AsyncByteStream, AsyncInputStream, ContentReader, OpenFlags, StreamCondition, WaitFlags};
pub use target::{EventTarget, TokioTarget};
pub use transport::{FetchTransport, HandleLease};
pub use worker::{WorkerHandle, WorkerService};
