//! Client error types.

use std::time::Duration;
use stowage_core::{ErrorClass, UploadStatus};
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised by the upload engine and its transports.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
        /// Wait requested by the server's `Retry-After` header.
        retry_after: Option<Duration>,
    },

    #[error("chunk sent at offset {sent} but server is at {server}")]
    OffsetMismatch { sent: u64, server: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("failed to read source: {0}")]
    Source(#[from] std::io::Error),

    #[error("source is {actual} bytes but the session expects {expected}")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("cannot {operation} a session that is {status}")]
    InvalidState {
        operation: &'static str,
        status: UploadStatus,
    },

    #[error("upload was cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] stowage_core::Error),
}

impl ClientError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Timeout(_) | Self::OffsetMismatch { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Minimum wait before retrying, when the server asked for one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Status { status: 429, .. } => ErrorClass::RateLimited,
            Self::Status {
                status: 400 | 413 | 415,
                ..
            } => ErrorClass::ValidationRejected,
            Self::SourceChanged { .. } => ErrorClass::IntegrityMismatch,
            Self::InvalidUrl(_) => ErrorClass::Configuration,
            _ => ErrorClass::TransientIo,
        }
    }
}
