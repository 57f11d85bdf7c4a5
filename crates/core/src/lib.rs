//! Core domain types and shared logic for the stowage upload pipeline.
//!
//! This crate defines the data model used across all other crates:
//! - Upload session lifecycle and metadata
//! - Completion jobs and the failure taxonomy
//! - Content hashing
//! - Filename and file-signature validators
//! - Configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod job;
pub mod upload;
pub mod validate;

pub use error::{Error, ErrorClass, Result};
pub use hash::{ContentHash, ContentHasher};
pub use job::{CompletionFile, CompletionJob, JobFailure, JobId, JobPhase};
pub use upload::{
    FileDescriptor, RetryState, UploadId, UploadMetadata, UploadProgress, UploadSession,
    UploadStatus,
};
pub use validate::{SanitizeOptions, SignatureTable, sanitize, validate_filename};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size: 100 MiB
pub const MAX_CHUNK_SIZE: u64 = 100 * 1024 * 1024;

/// Minimum chunk size: 64 KiB
pub const MIN_CHUNK_SIZE: u64 = 64 * 1024;
