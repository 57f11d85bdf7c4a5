//! Error types for the core domain.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("content signature does not match declared type {declared}")]
    SignatureMismatch { declared: String },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid chunk size: {size} (must be between {min} and {max})")]
    InvalidChunkSize { size: u64, min: u64, max: u64 },

    #[error("upload session error: {0}")]
    UploadSession(String),

    #[error("invalid completion job: {0}")]
    InvalidJob(String),

    #[error("invalid signature table: {0}")]
    SignatureTable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error for reporting across component boundaries.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::HashMismatch { .. } => ErrorClass::IntegrityMismatch,
            Self::SignatureTable(_) => ErrorClass::Configuration,
            _ => ErrorClass::ValidationRejected,
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline-wide failure taxonomy.
///
/// Every error that leaves a component is reduced to one of these classes so
/// retry decisions and operator-facing reports stay consistent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or backend throttling. Retry.
    TransientIo,
    /// Checksum did not match. Never retried.
    IntegrityMismatch,
    /// Filename or signature checks failed at intake.
    ValidationRejected,
    /// Rejected by the rate governor. Retry after the hint.
    RateLimited,
    /// Missing credentials, bucket, or other startup configuration.
    Configuration,
    /// Storage kept failing after every retry. Terminal for the job.
    StorageError,
}

impl ErrorClass {
    /// Stable identifier for metrics labels and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::IntegrityMismatch => "integrity_mismatch",
            Self::ValidationRejected => "validation_rejected",
            Self::RateLimited => "rate_limited",
            Self::Configuration => "configuration",
            Self::StorageError => "storage_error",
        }
    }

    /// Whether a failure of this class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo | Self::RateLimited)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
