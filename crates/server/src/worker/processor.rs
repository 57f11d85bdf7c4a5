use super::locks::KeyLocks;
use super::records::{FileRecord, RecordStore};
use super::retry::{RetryPolicy, retry};
use super::status::JobStatusBoard;
use super::JobError;
use crate::metrics;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use stowage_core::config::WorkerConfig;
use stowage_core::{
    CompletionJob, ContentHash, ErrorClass, JobFailure, JobPhase, SignatureTable,
};
use stowage_storage::{
    MultipartOptions, ObjectMeta, PresignOperation, StorageError, StorageTiers, UploadOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// How a delivery ended, which decides how it is settled with the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Terminal failure; the record was marked failed.
    Failed(JobFailure),
    /// Shutdown interrupted the job; it should be delivered again.
    Interrupted,
    /// The file is in permanent storage but the record update gave up.
    RecordUpdateAbandoned,
}

/// Runs one completion job through validate, migrate and record update.
pub struct CompletionProcessor {
    tiers: StorageTiers,
    records: Arc<dyn RecordStore>,
    signatures: Arc<SignatureTable>,
    config: WorkerConfig,
    locks: KeyLocks,
    statuses: JobStatusBoard,
}

impl CompletionProcessor {
    pub fn new(
        tiers: StorageTiers,
        records: Arc<dyn RecordStore>,
        signatures: Arc<SignatureTable>,
        config: WorkerConfig,
        statuses: JobStatusBoard,
    ) -> Self {
        Self {
            tiers,
            records,
            signatures,
            config,
            locks: KeyLocks::new(),
            statuses,
        }
    }

    pub fn statuses(&self) -> &JobStatusBoard {
        &self.statuses
    }

    #[instrument(skip_all, fields(job_id = %job.job_id, attempt = job.attempt))]
    pub async fn process(
        &self,
        job: CompletionJob,
        redelivered: bool,
        shutdown: &CancellationToken,
    ) -> JobOutcome {
        let started = Instant::now();
        let job = &job;
        let dest = job.permanent_key();
        let dest = dest.as_str();

        // Jobs targeting the same key never interleave.
        let _guard = self.locks.lock(dest).await;
        self.statuses
            .transition(job.job_id, job.attempt, JobPhase::Received);
        self.statuses.set_permanent_key(job.job_id, dest);

        let storage_policy = RetryPolicy::storage(&self.config);

        let existing = match retry(storage_policy, "check_destination", shutdown, move |_| {
            self.destination_holds(job, dest)
        })
        .await
        {
            Ok(existing) => existing,
            Err((e, attempt)) => return self.fail(job, e, attempt).await,
        };

        let stored = match existing {
            Some(meta) => {
                tracing::info!(
                    key = %dest,
                    redelivered,
                    "destination already holds the file, skipping transfer"
                );
                metrics::REDELIVERIES_SHORT_CIRCUITED.inc();
                self.discard_temporary(job).await;
                meta
            }
            None => {
                self.statuses
                    .transition(job.job_id, job.attempt, JobPhase::Validating);
                if let Err((e, attempt)) = retry(storage_policy, "validate", shutdown, move |_| {
                    self.validate(job)
                })
                .await
                {
                    return self.fail(job, e, attempt).await;
                }

                self.statuses
                    .transition(job.job_id, job.attempt, JobPhase::Migrating);
                match retry(storage_policy, "migrate", shutdown, move |_| {
                    self.migrate(job, dest)
                })
                .await
                {
                    Ok(meta) => meta,
                    Err((e, attempt)) => return self.fail(job, e, attempt).await,
                }
            }
        };

        self.statuses
            .transition(job.job_id, job.attempt, JobPhase::RecordUpdating);
        let record_policy = RetryPolicy::record_update(&self.config);
        let stored = &stored;
        let outcome = match retry(record_policy, "record_update", shutdown, move |_| {
            self.update_record(job, dest, stored)
        })
        .await
        {
            Ok(()) => {
                self.statuses
                    .transition(job.job_id, job.attempt, JobPhase::Completed);
                metrics::JOBS_COMPLETED.inc();
                tracing::info!(key = %dest, "completion job finished");
                JobOutcome::Completed
            }
            Err((JobError::Cancelled, _)) => JobOutcome::Interrupted,
            Err((e, attempt)) => {
                // The migration stands; only the record is behind.
                tracing::error!(
                    key = %dest,
                    attempt,
                    class = e.class().as_str(),
                    error = %e,
                    "record update abandoned, file remains in permanent storage"
                );
                self.statuses.note_error(
                    job.job_id,
                    JobFailure {
                        class: e.class(),
                        message: e.to_string(),
                        attempt,
                    },
                );
                JobOutcome::RecordUpdateAbandoned
            }
        };

        metrics::JOB_DURATION.observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn fail(&self, job: &CompletionJob, error: JobError, attempt: u32) -> JobOutcome {
        if matches!(error, JobError::Cancelled) {
            tracing::info!("completion job interrupted by shutdown");
            return JobOutcome::Interrupted;
        }

        // A transient error that reaches this point has used up its retries.
        let class = match error.class() {
            ErrorClass::TransientIo => ErrorClass::StorageError,
            class => class,
        };
        let failure = JobFailure {
            class,
            message: error.to_string(),
            attempt,
        };
        tracing::error!(
            attempt,
            class = failure.class.as_str(),
            error = %error,
            "completion job failed"
        );
        metrics::record_job_failure(failure.class.as_str());
        self.statuses.failed(job.job_id, failure.clone());

        if let Err(e) = self
            .records
            .mark_file_failed(&job.submission_id, &job.field, &failure)
            .await
        {
            tracing::warn!(error = %e, "could not mark submission file as failed");
        }
        JobOutcome::Failed(failure)
    }

    /// Bound a step by the configured operation timeout.
    async fn timed<T>(
        &self,
        step: &'static str,
        fut: impl Future<Output = Result<T, JobError>>,
    ) -> Result<T, JobError> {
        let limit = self.config.operation_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| JobError::Timeout {
                step,
                secs: limit.as_secs(),
            })?
    }

    /// The destination's metadata when it already holds exactly the declared file.
    async fn destination_holds(
        &self,
        job: &CompletionJob,
        dest: &str,
    ) -> Result<Option<ObjectMeta>, JobError> {
        self.timed("check_destination", async {
            match self.tiers.permanent.head(dest).await {
                Ok(meta) => {
                    let matches = meta.size == job.file.size
                        && meta
                            .checksum
                            .as_deref()
                            .is_some_and(|c| c.eq_ignore_ascii_case(&job.file.declared_checksum));
                    if !matches {
                        tracing::warn!(key = %dest, "destination holds different content, overwriting");
                    }
                    Ok(matches.then_some(meta))
                }
                Err(StorageError::NotFound(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Stream the temporary object and check size, checksum and signature.
    async fn validate(&self, job: &CompletionJob) -> Result<(), JobError> {
        self.timed("validate", async {
            let temp_key = &job.file.temp_key;
            let mut stream = self
                .tiers
                .temporary
                .download(temp_key)
                .await
                .map_err(|e| missing_source(e, temp_key))?;

            let sniff_len = self.signatures.max_signature_len();
            let mut leading = Vec::with_capacity(sniff_len);
            let mut hasher = ContentHash::hasher();
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if leading.len() < sniff_len {
                    let take = (sniff_len - leading.len()).min(chunk.len());
                    leading.extend_from_slice(&chunk[..take]);
                }
                hasher.update(&chunk);
                size += chunk.len() as u64;
            }

            if size != job.file.size {
                return Err(JobError::SizeMismatch {
                    declared: job.file.size,
                    actual: size,
                });
            }
            let actual = hasher.finalize();
            if !actual.matches_declared(&job.file.declared_checksum) {
                return Err(JobError::IntegrityMismatch {
                    declared: job.file.declared_checksum.clone(),
                    actual: actual.to_hex(),
                });
            }
            if self.config.verify_signature
                && !self.signatures.verify_type(&leading, &job.file.content_type)
            {
                return Err(JobError::SignatureRejected(job.file.content_type.clone()));
            }
            Ok(())
        })
        .await
    }

    /// Write the permanent copy, confirm it, then drop the temporary one.
    async fn migrate(&self, job: &CompletionJob, dest: &str) -> Result<ObjectMeta, JobError> {
        self.timed("migrate", async {
            let temp_key = &job.file.temp_key;
            if self.tiers.is_shared() {
                self.tiers
                    .permanent
                    .copy(temp_key, dest)
                    .await
                    .map_err(|e| missing_source(e, temp_key))?;
            } else {
                let stream = self
                    .tiers
                    .temporary
                    .download(temp_key)
                    .await
                    .map_err(|e| missing_source(e, temp_key))?;
                let mut options = UploadOptions::with_content_type(job.file.content_type.clone())
                    .expect_checksum(job.file.declared_checksum.to_ascii_lowercase());
                options
                    .metadata
                    .insert("form_id".to_string(), job.form_id.clone());
                options
                    .metadata
                    .insert("submission_id".to_string(), job.submission_id.clone());
                let job_id = job.job_id;
                let multipart = MultipartOptions {
                    chunk_size: self.config.part_size as usize,
                    concurrency: self.config.part_concurrency,
                    on_progress: Some(Arc::new(move |p| {
                        tracing::debug!(
                            job_id = %job_id,
                            part = p.part_number,
                            bytes = p.bytes_uploaded,
                            "migrated part"
                        );
                    })),
                };
                self.tiers
                    .permanent
                    .multipart_upload(dest, stream, options, multipart)
                    .await?;
            }

            let meta = self.tiers.permanent.head(dest).await?;
            if meta.size != job.file.size {
                return Err(JobError::Unconfirmed {
                    key: dest.to_string(),
                    reason: format!("size {} != {}", meta.size, job.file.size),
                });
            }
            match meta.checksum.as_deref() {
                Some(c) if c.eq_ignore_ascii_case(&job.file.declared_checksum) => {}
                Some(c) => {
                    return Err(JobError::Unconfirmed {
                        key: dest.to_string(),
                        reason: format!("checksum {c} != {}", job.file.declared_checksum),
                    });
                }
                None => {
                    tracing::warn!(key = %dest, "destination has no stored checksum, confirmed by size only");
                }
            }

            self.discard_temporary(job).await;
            Ok(meta)
        })
        .await
    }

    async fn discard_temporary(&self, job: &CompletionJob) {
        if let Err(e) = self.tiers.temporary.delete(&job.file.temp_key).await {
            tracing::warn!(
                key = %job.file.temp_key,
                error = %e,
                "failed to delete temporary object"
            );
        }
    }

    async fn access_url(&self, key: &str) -> Result<String, JobError> {
        if let Some(base) = &self.config.public_base_url {
            return Ok(format!("{}/{}", base.trim_end_matches('/'), key));
        }
        Ok(self
            .tiers
            .permanent
            .presign(
                key,
                PresignOperation::Read,
                self.config.access_url_expiry(),
            )
            .await?)
    }

    async fn update_record(
        &self,
        job: &CompletionJob,
        dest: &str,
        stored: &ObjectMeta,
    ) -> Result<(), JobError> {
        let url = self.access_url(dest).await?;
        let record = FileRecord {
            key: dest.to_string(),
            url,
            size: stored.size,
            checksum: stored
                .checksum
                .clone()
                .unwrap_or_else(|| job.file.declared_checksum.to_ascii_lowercase()),
        };
        self.timed("record_update", async {
            self.records
                .update_file_field(&job.submission_id, &job.field, record)
                .await
                .map_err(JobError::from)
        })
        .await
    }
}

fn missing_source(error: StorageError, key: &str) -> JobError {
    match error {
        StorageError::NotFound(_) => JobError::MissingSource(key.to_string()),
        other => JobError::Storage(other),
    }
}
