//! Server-side state for resumable uploads.
//!
//! Each PATCH body is stored as its own part object under
//! `{temp_prefix}/{upload_id}/parts/`. Finalize concatenates the parts into
//! `{temp_prefix}/{upload_id}/data` with a multipart upload and hands that key
//! to the completion worker.

use crate::metrics;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{JobId, UploadId, UploadMetadata};
use stowage_storage::{
    ByteStream, MultipartOptions, ObjectStore, StorageResult, UploadOptions, UploadResult,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One resumable upload as seen by the intake endpoints.
#[derive(Debug)]
pub struct IntakeSession {
    pub id: UploadId,
    /// Declared total length.
    pub length: u64,
    pub metadata: UploadMetadata,
    /// Bytes stored so far.
    pub offset: u64,
    /// Part keys in offset order.
    pub parts: Vec<String>,
    /// Set once finalize has enqueued the completion job.
    pub job_id: Option<JobId>,
    /// Last time a request changed this session.
    pub touched: Instant,
}

impl IntakeSession {
    pub fn new(length: u64, metadata: UploadMetadata) -> Self {
        Self {
            id: UploadId::new(),
            length,
            metadata,
            offset: 0,
            parts: Vec::new(),
            job_id: None,
            touched: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.touched = Instant::now();
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.length
    }

    pub fn is_finalized(&self) -> bool {
        self.job_id.is_some()
    }
}

/// Open intake sessions. Each session sits behind its own lock so chunk
/// writes for one upload are applied one at a time.
#[derive(Clone, Default)]
pub struct IntakeSessions {
    sessions: Arc<DashMap<UploadId, Arc<Mutex<IntakeSession>>>>,
}

impl IntakeSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: IntakeSession) -> UploadId {
        let id = session.id;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        metrics::INTAKE_SESSIONS_CREATED.inc();
        metrics::ACTIVE_INTAKE_SESSIONS.inc();
        id
    }

    pub fn get(&self, id: &UploadId) -> Option<Arc<Mutex<IntakeSession>>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Drop a session. `was_active` is false for sessions already finalized.
    pub fn remove(&self, id: &UploadId, was_active: bool) {
        if self.sessions.remove(id).is_some() && was_active {
            metrics::ACTIVE_INTAKE_SESSIONS.dec();
        }
    }

    /// Drop sessions idle longer than they may be kept.
    ///
    /// Unfinished sessions expire after `idle_ttl` and their part objects are
    /// deleted from `store`; finalized sessions expire after `retention`.
    /// Sessions locked by a request in progress are left for the next sweep.
    pub async fn sweep_expired(
        &self,
        store: &dyn ObjectStore,
        now: Instant,
        idle_ttl: Duration,
        retention: Duration,
    ) -> SweepOutcome {
        let candidates: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut outcome = SweepOutcome::default();
        let mut orphaned = Vec::new();
        for (id, session) in candidates {
            let Ok(mut session) = session.try_lock() else {
                continue;
            };
            let finalized = session.is_finalized();
            let limit = if finalized { retention } else { idle_ttl };
            if now.saturating_duration_since(session.touched) < limit {
                continue;
            }
            if finalized {
                outcome.finalized += 1;
            } else {
                outcome.abandoned += 1;
                orphaned.append(&mut session.parts);
            }
            self.remove(&id, !finalized);
        }

        outcome.parts_deleted = orphaned.len();
        discard_parts(store, &orphaned).await;
        outcome
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Unfinished sessions discarded.
    pub abandoned: usize,
    /// Finalized sessions past their retention.
    pub finalized: usize,
    pub parts_deleted: usize,
}

/// Spawn a background task that sweeps expired sessions until `shutdown`
/// is cancelled.
pub fn spawn_session_sweeper(
    sessions: IntakeSessions,
    store: Arc<dyn ObjectStore>,
    idle_ttl: Duration,
    retention: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Intake session sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let outcome = sessions
                        .sweep_expired(store.as_ref(), Instant::now(), idle_ttl, retention)
                        .await;
                    if outcome != SweepOutcome::default() {
                        tracing::info!(
                            abandoned = outcome.abandoned,
                            finalized = outcome.finalized,
                            parts_deleted = outcome.parts_deleted,
                            "Intake session sweeper evicted expired sessions"
                        );
                    }
                }
            }
        }
    })
}

/// Key of the part stored for a chunk at `offset`.
///
/// The offset is zero-padded so part keys sort in byte order.
pub fn part_key(temp_prefix: &str, id: &UploadId, offset: u64) -> String {
    format!("{}/{id}/parts/{offset:020}", temp_prefix.trim_end_matches('/'))
}

/// Key of the assembled upload.
pub fn data_key(temp_prefix: &str, id: &UploadId) -> String {
    format!("{}/{id}/data", temp_prefix.trim_end_matches('/'))
}

/// Concatenate `parts` into `dest` as one multipart upload.
pub async fn assemble(
    store: Arc<dyn ObjectStore>,
    parts: Vec<String>,
    dest: &str,
    content_type: &str,
    part_size: u64,
) -> StorageResult<UploadResult> {
    let source = store.clone();
    let stream = async_stream::try_stream! {
        for key in parts {
            let mut part = source.download(&key).await?;
            while let Some(chunk) = part.next().await {
                yield chunk?;
            }
        }
    };
    let stream: ByteStream = Box::pin(stream);

    store
        .multipart_upload(
            dest,
            stream,
            UploadOptions::with_content_type(content_type),
            MultipartOptions {
                chunk_size: part_size as usize,
                ..MultipartOptions::default()
            },
        )
        .await
}

/// Delete part objects, logging failures. Leftover parts are garbage only.
pub async fn discard_parts(store: &dyn ObjectStore, parts: &[String]) {
    for key in parts {
        if let Err(e) = store.delete(key).await {
            tracing::warn!(key = %key, error = %e, "failed to delete upload part");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stowage_storage::{FilesystemBackend, ObjectStoreExt};
    use tempfile::tempdir;

    #[test]
    fn test_part_keys_sort_by_offset() {
        let id = UploadId::new();
        let low = part_key("uploads/", &id, 9);
        let high = part_key("uploads", &id, 10 * 1024 * 1024);
        assert!(low < high);
        assert!(low.starts_with(&format!("uploads/{id}/parts/")));
        assert_eq!(data_key("uploads", &id), format!("uploads/{id}/data"));
    }

    #[tokio::test]
    async fn test_assemble_concatenates_parts() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());
        let id = UploadId::new();

        let mut parts = Vec::new();
        for (offset, chunk) in [(0u64, &b"hello "[..]), (6, b"resumable "), (16, b"world")] {
            let key = part_key("uploads", &id, offset);
            store
                .upload(&key, Bytes::from_static(chunk), UploadOptions::default())
                .await
                .unwrap();
            parts.push(key);
        }

        let dest = data_key("uploads", &id);
        let result = assemble(store.clone(), parts.clone(), &dest, "text/plain", 5 * 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(result.size, 21);

        let data = store.download_bytes(&dest).await.unwrap();
        assert_eq!(&data[..], b"hello resumable world");

        discard_parts(store.as_ref(), &parts).await;
        for key in &parts {
            assert!(!store.exists(key).await.unwrap());
        }
    }

    async fn session_with_part(
        sessions: &IntakeSessions,
        store: &dyn ObjectStore,
    ) -> (UploadId, String) {
        let id = sessions.insert(IntakeSession::new(10, UploadMetadata::default()));
        let key = part_key("uploads", &id, 0);
        store
            .upload(&key, Bytes::from_static(b"0123"), UploadOptions::default())
            .await
            .unwrap();
        let session = sessions.get(&id).unwrap();
        let mut session = session.lock().await;
        session.parts.push(key.clone());
        session.offset = 4;
        (id, key)
    }

    #[tokio::test]
    async fn test_sweep_discards_abandoned_sessions() {
        let dir = tempdir().unwrap();
        let store = FilesystemBackend::new(dir.path()).await.unwrap();
        let sessions = IntakeSessions::new();
        let (stale, stale_part) = session_with_part(&sessions, &store).await;
        let ttl = Duration::from_secs(3600);
        let retention = Duration::from_secs(60);

        // Nothing is old enough yet.
        let outcome = sessions
            .sweep_expired(&store, Instant::now(), ttl, retention)
            .await;
        assert_eq!(outcome, SweepOutcome::default());
        assert_eq!(sessions.len(), 1);

        let later = Instant::now() + ttl + Duration::from_secs(1);
        let (fresh, fresh_part) = session_with_part(&sessions, &store).await;
        sessions.get(&fresh).unwrap().lock().await.touched = later;

        let outcome = sessions.sweep_expired(&store, later, ttl, retention).await;
        assert_eq!(outcome.abandoned, 1);
        assert_eq!(outcome.parts_deleted, 1);
        assert!(sessions.get(&stale).is_none());
        assert!(!store.exists(&stale_part).await.unwrap());
        assert!(sessions.get(&fresh).is_some());
        assert!(store.exists(&fresh_part).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_keeps_finalized_sessions_for_retention() {
        let dir = tempdir().unwrap();
        let store = FilesystemBackend::new(dir.path()).await.unwrap();
        let sessions = IntakeSessions::new();
        let id = sessions.insert(IntakeSession::new(4, UploadMetadata::default()));
        sessions.get(&id).unwrap().lock().await.job_id = Some(JobId::new());

        let ttl = Duration::from_secs(3600);
        let retention = Duration::from_secs(60);
        let soon = Instant::now() + Duration::from_secs(30);
        let outcome = sessions.sweep_expired(&store, soon, ttl, retention).await;
        assert_eq!(outcome.finalized, 0);
        assert!(sessions.get(&id).is_some());

        let later = Instant::now() + Duration::from_secs(61);
        let outcome = sessions.sweep_expired(&store, later, ttl, retention).await;
        assert_eq!(outcome.finalized, 1);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_sessions_in_use() {
        let dir = tempdir().unwrap();
        let store = FilesystemBackend::new(dir.path()).await.unwrap();
        let sessions = IntakeSessions::new();
        let (id, part) = session_with_part(&sessions, &store).await;

        let session = sessions.get(&id).unwrap();
        let guard = session.lock().await;
        let later = Instant::now() + Duration::from_secs(7200);
        let outcome = sessions
            .sweep_expired(&store, later, Duration::from_secs(60), Duration::from_secs(60))
            .await;
        assert_eq!(outcome, SweepOutcome::default());
        drop(guard);

        assert!(sessions.get(&id).is_some());
        assert!(store.exists(&part).await.unwrap());
    }
}
