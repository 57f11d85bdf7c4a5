//! API error types.

use crate::worker::QueueError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stowage_core::ErrorClass;
use stowage_core::validate::FilenameIssue;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("offset mismatch: upload is at {expected}, request sent {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("filename rejected: {}", join_issues(.0))]
    InvalidFilename(Vec<FilenameIssue>),

    #[error("content does not match declared type {0}")]
    UnsupportedMediaType(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] stowage_storage::StorageError),

    #[error("core error: {0}")]
    Core(#[from] stowage_core::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

fn join_issues(issues: &[FilenameIssue]) -> String {
    issues
        .iter()
        .map(FilenameIssue::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::InvalidFilename(_) | Self::UnsupportedMediaType(_) => {
                ErrorClass::ValidationRejected.as_str()
            }
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Core(_) => "core_error",
            Self::Queue(_) => "queue_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidFilename(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                stowage_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
            Self::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
