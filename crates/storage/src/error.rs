//! Storage error types.

use stowage_core::ErrorClass;
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("presigning not supported: {0}")]
    PresignUnsupported(String),

    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),
}

/// Whether an S3 service error with this HTTP status may succeed on retry.
pub fn is_retryable_s3_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

impl StorageError {
    /// Permanent error for an S3 service response that is not worth retrying.
    pub fn from_s3_status(status: u16, message: String) -> Self {
        match status {
            403 => Self::AccessDenied(message),
            // Key lookups map 404 to `NotFound` before getting here, so this
            // is a missing bucket or multipart upload.
            404 => Self::Config(format!("S3 resource not found: {message}")),
            _ => Self::Rejected { status, message },
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
            ),
            Self::S3(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Classify for reporting across component boundaries.
    ///
    /// A missing object the pipeline previously acknowledged means stored
    /// bytes were lost, which is reported as an integrity failure.
    pub fn class(&self) -> ErrorClass {
        if self.is_transient() {
            return ErrorClass::TransientIo;
        }
        match self {
            Self::NotFound(_) | Self::ChecksumMismatch { .. } => ErrorClass::IntegrityMismatch,
            Self::InvalidKey(_) | Self::InvalidContinuationToken(_) => {
                ErrorClass::ValidationRejected
            }
            _ => ErrorClass::Configuration,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
