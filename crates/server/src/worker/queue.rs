//! Completion job queue.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use stowage_core::CompletionJob;
use tokio::sync::{Mutex, Notify};

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("unknown delivery tag: {0}")]
    UnknownDelivery(u64),
}

/// A job handed to a worker. Must be acked or failed.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub tag: u64,
    pub job: CompletionJob,
    /// True when this job was handed out before and not acked.
    pub redelivered: bool,
}

/// At-least-once queue of completion jobs.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: CompletionJob) -> Result<(), QueueError>;

    /// Wait for the next job. `None` once the queue is closed and drained.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered job for good.
    async fn ack(&self, tag: u64) -> Result<(), QueueError>;

    /// Negative-acknowledge. With `requeue` the job is delivered again with
    /// its attempt counter bumped; otherwise it moves to the dead-letter list.
    async fn fail(&self, tag: u64, requeue: bool) -> Result<(), QueueError>;
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<(CompletionJob, bool)>,
    in_flight: HashMap<u64, CompletionJob>,
    dead_letters: Vec<CompletionJob>,
    next_tag: u64,
    closed: bool,
}

/// In-process queue.
///
/// Jobs that are never acked (a worker dropped them or panicked) can be put
/// back with [`MemoryQueue::redeliver_in_flight`].
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting jobs and wake every waiting receiver.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Move every unacknowledged job back to the ready queue.
    pub async fn redeliver_in_flight(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut tags: Vec<u64> = inner.in_flight.keys().copied().collect();
        tags.sort_unstable();
        let count = tags.len();
        for tag in tags {
            if let Some(mut job) = inner.in_flight.remove(&tag) {
                job.attempt += 1;
                inner.ready.push_back((job, true));
            }
        }
        drop(inner);
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    pub async fn ready_len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    pub async fn dead_letters(&self) -> Vec<CompletionJob> {
        self.inner.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: CompletionJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.ready.push_back((job, false));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        loop {
            // Register interest before checking so a close() between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some((job, redelivered)) = inner.ready.pop_front() {
                    inner.next_tag += 1;
                    let tag = inner.next_tag;
                    inner.in_flight.insert(tag, job.clone());
                    return Ok(Some(Delivery {
                        tag,
                        job,
                        redelivered,
                    }));
                }
                if inner.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), QueueError> {
        self.inner
            .lock()
            .await
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(tag))
    }

    async fn fail(&self, tag: u64, requeue: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mut job = inner
            .in_flight
            .remove(&tag)
            .ok_or(QueueError::UnknownDelivery(tag))?;
        if requeue && !inner.closed {
            job.attempt += 1;
            inner.ready.push_back((job, true));
            drop(inner);
            self.notify.notify_one();
        } else {
            inner.dead_letters.push(job);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use stowage_core::CompletionFile;

    fn job(name: &str) -> CompletionJob {
        CompletionJob::new(
            "form",
            "sub",
            None,
            CompletionFile {
                temp_key: format!("uploads/{name}/data"),
                final_name_hint: name.to_string(),
                declared_checksum: "00".repeat(32),
                size: 1,
                content_type: "text/plain".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = MemoryQueue::new();
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.job.file.final_name_hint, "a");
        assert_eq!(second.job.file.final_name_hint, "b");
        assert!(!first.redelivered);

        queue.ack(first.tag).await.unwrap();
        assert!(matches!(
            queue.ack(first.tag).await,
            Err(QueueError::UnknownDelivery(_))
        ));
        assert_eq!(queue.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_with_requeue_bumps_attempt() {
        let queue = MemoryQueue::new();
        queue.enqueue(job("a")).await.unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.job.attempt, 1);

        queue.fail(delivery.tag, true).await.unwrap();
        let again = queue.receive().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.job.attempt, 2);
        assert_eq!(again.job.job_id, delivery.job.job_id);

        queue.fail(again.tag, false).await.unwrap();
        assert_eq!(queue.dead_letters().await.len(), 1);
        assert_eq!(queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn test_redeliver_in_flight_after_crash() {
        let queue = MemoryQueue::new();
        queue.enqueue(job("a")).await.unwrap();
        let lost = queue.receive().await.unwrap().unwrap();

        assert_eq!(queue.redeliver_in_flight().await, 1);
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.job.job_id, lost.job.job_id);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_receive_waits_for_enqueue_and_close() {
        let queue = Arc::new(MemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(job("late")).await.unwrap();
        let delivery = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job.file.final_name_hint, "late");

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close().await;
        assert!(waiting.await.unwrap().unwrap().is_none());
        assert!(matches!(
            queue.enqueue(job("x")).await,
            Err(QueueError::Closed)
        ));
    }
}
