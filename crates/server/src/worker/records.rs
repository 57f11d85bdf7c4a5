//! Submission record store boundary.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use stowage_core::{ErrorClass, JobFailure};

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("submission not found: {0}")]
    NotFound(String),
}

/// What the worker writes into the submission's file field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Permanent storage key.
    pub key: String,
    /// Access URL (presigned or public).
    pub url: String,
    pub size: u64,
    pub checksum: String,
}

/// State of a submission's file field as seen by the record store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldState {
    Stored(FileRecord),
    Failed { class: ErrorClass, message: String },
}

/// The owning system's record store.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Point a submission's file field at its permanent object. Must be idempotent.
    async fn update_file_field(
        &self,
        submission_id: &str,
        field: &str,
        record: FileRecord,
    ) -> Result<(), RecordError>;

    /// Mark a submission's file field as failed.
    async fn mark_file_failed(
        &self,
        submission_id: &str,
        field: &str,
        failure: &JobFailure,
    ) -> Result<(), RecordError>;
}

/// In-process record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    fields: DashMap<(String, String), FieldState>,
    updates: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&self, submission_id: &str, field: &str) -> Option<FieldState> {
        self.fields
            .get(&(submission_id.to_string(), field.to_string()))
            .map(|f| f.clone())
    }

    /// Successful `update_file_field` calls.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn update_file_field(
        &self,
        submission_id: &str,
        field: &str,
        record: FileRecord,
    ) -> Result<(), RecordError> {
        self.fields.insert(
            (submission_id.to_string(), field.to_string()),
            FieldState::Stored(record),
        );
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn mark_file_failed(
        &self,
        submission_id: &str,
        field: &str,
        failure: &JobFailure,
    ) -> Result<(), RecordError> {
        self.fields.insert(
            (submission_id.to_string(), field.to_string()),
            FieldState::Failed {
                class: failure.class,
                message: failure.user_message(),
            },
        );
        Ok(())
    }
}
