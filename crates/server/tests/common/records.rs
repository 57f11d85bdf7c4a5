//! Record store wrapper that injects update failures.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use stowage_core::JobFailure;
use stowage_server::worker::{FieldState, FileRecord, MemoryRecordStore, RecordError, RecordStore};

/// Wraps a [`MemoryRecordStore`]; the next `n` field updates can be made to
/// fail with `Unavailable`.
#[allow(dead_code)]
#[derive(Default)]
pub struct FlakyRecords {
    inner: MemoryRecordStore,
    failures_remaining: AtomicU32,
}

#[allow(dead_code)]
impl FlakyRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_updates(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn field(&self, submission_id: &str, field: &str) -> Option<FieldState> {
        self.inner.field(submission_id, field)
    }

    pub fn update_count(&self) -> usize {
        self.inner.update_count()
    }
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn update_file_field(
        &self,
        submission_id: &str,
        field: &str,
        record: FileRecord,
    ) -> Result<(), RecordError> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RecordError::Unavailable("injected failure".to_string()));
        }
        self.inner.update_file_field(submission_id, field, record).await
    }

    async fn mark_file_failed(
        &self,
        submission_id: &str,
        field: &str,
        failure: &JobFailure,
    ) -> Result<(), RecordError> {
        self.inner.mark_file_failed(submission_id, field, failure).await
    }
}
