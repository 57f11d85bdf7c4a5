use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use stowage_core::{JobFailure, JobId, JobPhase};
use time::OffsetDateTime;

/// Last known state of a completion job.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permanent_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Job statuses, readable by the job status endpoint.
#[derive(Clone, Default)]
pub struct JobStatusBoard {
    jobs: Arc<DashMap<JobId, JobStatus>>,
}

impl JobStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|s| s.clone())
    }

    pub fn received(&self, job_id: JobId, attempt: u32) {
        self.jobs.insert(
            job_id,
            JobStatus {
                job_id,
                phase: JobPhase::Received,
                attempt,
                permanent_key: None,
                error: None,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    /// Move a job to `phase`, keeping anything already known about it.
    pub fn transition(&self, job_id: JobId, attempt: u32, phase: JobPhase) {
        let mut entry = self.jobs.entry(job_id).or_insert_with(|| JobStatus {
            job_id,
            phase,
            attempt,
            permanent_key: None,
            error: None,
            updated_at: OffsetDateTime::now_utc(),
        });
        entry.phase = phase;
        entry.attempt = attempt;
        entry.updated_at = OffsetDateTime::now_utc();
        if phase != JobPhase::Failed {
            entry.error = None;
        }
    }

    pub fn set_permanent_key(&self, job_id: JobId, key: &str) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.permanent_key = Some(key.to_string());
        }
    }

    /// Record an error without changing the phase.
    pub fn note_error(&self, job_id: JobId, failure: JobFailure) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            entry.error = Some(failure);
            entry.updated_at = OffsetDateTime::now_utc();
        }
    }

    pub fn failed(&self, job_id: JobId, failure: JobFailure) {
        self.transition(job_id, failure.attempt, JobPhase::Failed);
        self.note_error(job_id, failure);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
