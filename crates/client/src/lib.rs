//! Client side of the stowage resumable upload protocol.
//!
//! An [`UploadEngine`] drives one upload through a [`Transport`]: it sends
//! fixed-size chunks from a [`ChunkSource`], retries transient failures on a
//! delay schedule, and can be paused, resumed, cancelled, or snapshotted and
//! restored in another process. [`HttpTransport`] speaks the intake server's
//! HTTP endpoints.

pub mod error;
pub mod http;
pub mod session;
pub mod source;
pub mod transport;

pub use error::{ClientError, Result};
pub use http::HttpTransport;
pub use session::{
    Control, DEFAULT_RETRY_DELAYS, SessionConfig, SessionHandle, SessionSnapshot, Step,
    UploadEngine,
};
pub use source::{ChunkSource, FileSource, checksum};
pub use transport::{FinalizeReceipt, Transport};
