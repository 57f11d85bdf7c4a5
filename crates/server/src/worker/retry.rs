//! Exponential backoff for worker steps.

use super::JobError;
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use stowage_core::config::WorkerConfig;
use tokio_util::sync::CancellationToken;

/// Backoff schedule for one worker step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries until shutdown.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for storage steps (validation and migration).
    pub fn storage(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: Some(config.max_attempts.max(1)),
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    /// Policy for the record update.
    pub fn record_update(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.record_update_limit(),
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` has just failed.
    /// Doubles from `base_delay`: 1s, 2s, 4s, ... capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// On failure returns the last error and the attempt it happened on.
/// Backoff sleeps end early with [`JobError::Cancelled`] when `shutdown` fires.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    step: &'static str,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T, (JobError, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !error.is_transient() || policy.exhausted(attempt) {
            return Err((error, attempt));
        }

        let delay = policy.delay_after(attempt);
        metrics::record_job_retry(step);
        tracing::warn!(
            step,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retrying"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Err((JobError::Cancelled, attempt)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
