//! Completion worker.
//!
//! A pool of `worker.concurrency` tasks pulls [`CompletionJob`]s from a
//! [`JobQueue`], validates the uploaded bytes against the declared checksum,
//! moves them from temporary to permanent storage and updates the owning
//! submission record. Delivery is at-least-once; every step is idempotent.

mod locks;
mod processor;
pub mod queue;
pub mod records;
pub mod retry;
mod status;

pub use locks::KeyLocks;
pub use processor::{CompletionProcessor, JobOutcome};
pub use queue::{Delivery, JobQueue, MemoryQueue, QueueError};
pub use records::{FieldState, FileRecord, MemoryRecordStore, RecordError, RecordStore};
pub use retry::RetryPolicy;
pub use status::{JobStatus, JobStatusBoard};

use std::sync::Arc;
use stowage_core::{CompletionJob, ErrorClass};
use stowage_storage::StorageError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Errors raised while processing a single job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("checksum mismatch: declared {declared}, computed {actual}")]
    IntegrityMismatch { declared: String, actual: String },

    #[error("size mismatch: declared {declared} bytes, found {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("temporary object {0} is missing")]
    MissingSource(String),

    #[error("content does not match declared type {0}")]
    SignatureRejected(String),

    #[error("copy of {key} could not be confirmed: {reason}")]
    Unconfirmed { key: String, reason: String },

    #[error("{step} timed out after {secs}s")]
    Timeout { step: &'static str, secs: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("record update failed: {0}")]
    Record(#[from] RecordError),

    #[error("worker is shutting down")]
    Cancelled,
}

impl JobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::IntegrityMismatch { .. } | Self::SizeMismatch { .. } | Self::MissingSource(_) => {
                ErrorClass::IntegrityMismatch
            }
            Self::SignatureRejected(_) => ErrorClass::ValidationRejected,
            Self::Unconfirmed { .. } | Self::Timeout { .. } | Self::Record(_) | Self::Cancelled => {
                ErrorClass::TransientIo
            }
            Self::Storage(e) => e.class(),
        }
    }

    /// Whether the failed step may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Record(RecordError::NotFound(_)) => false,
            _ => self.class().is_retryable(),
        }
    }
}

/// The worker pool.
pub struct CompletionWorker {
    queue: Arc<dyn JobQueue>,
    processor: Arc<CompletionProcessor>,
    concurrency: usize,
}

impl CompletionWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: Arc<CompletionProcessor>,
        concurrency: usize,
    ) -> Self {
        Self {
            queue,
            processor,
            concurrency: concurrency.max(1),
        }
    }

    /// Start the pool. Tasks finish their current job and exit once
    /// `shutdown` is cancelled or the queue closes.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker_id in 0..self.concurrency {
            let queue = self.queue.clone();
            let processor = self.processor.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move {
                run_loop(worker_id, queue, processor, shutdown).await;
            });
        }
        tracing::info!(concurrency = self.concurrency, "Completion worker started");
        set
    }
}

async fn run_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<CompletionProcessor>,
    shutdown: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = queue.receive() => match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Failed to receive completion job");
                    break;
                }
            },
        };

        handle_delivery(worker_id, queue.as_ref(), &processor, delivery, &shutdown).await;
    }
    tracing::debug!(worker_id, "Completion worker task stopped");
}

/// Process one delivery in its own task so a panic is reported against the
/// job instead of taking the worker down.
async fn handle_delivery(
    worker_id: usize,
    queue: &dyn JobQueue,
    processor: &Arc<CompletionProcessor>,
    delivery: Delivery,
    shutdown: &CancellationToken,
) {
    let Delivery {
        tag,
        job,
        redelivered,
    } = delivery;
    let job_id = job.job_id;

    let task = {
        let processor = processor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { processor.process(job, redelivered, &shutdown).await })
    };

    let settle = match task.await {
        Ok(JobOutcome::Completed) | Ok(JobOutcome::Failed(_)) => queue.ack(tag).await,
        Ok(JobOutcome::Interrupted) => queue.fail(tag, true).await,
        Ok(JobOutcome::RecordUpdateAbandoned) => queue.fail(tag, false).await,
        Err(join_err) => {
            tracing::error!(
                worker_id,
                job_id = %job_id,
                panic = ?join_err,
                "Completion job panicked, requeueing"
            );
            queue.fail(tag, true).await
        }
    };

    if let Err(e) = settle {
        tracing::error!(job_id = %job_id, error = %e, "Failed to settle completion job");
    }
}

/// Enqueue a job and publish its initial status.
pub async fn submit(
    queue: &dyn JobQueue,
    statuses: &JobStatusBoard,
    job: CompletionJob,
) -> Result<(), QueueError> {
    let job_id = job.job_id;
    let attempt = job.attempt;
    queue.enqueue(job).await?;
    statuses.received(job_id, attempt);
    Ok(())
}
