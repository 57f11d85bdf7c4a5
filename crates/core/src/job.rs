//! Completion jobs produced when a resumable upload is finalized.

use crate::error::ErrorClass;
use crate::validate::filename::{SanitizeOptions, sanitize};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a completion job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidJob(format!("invalid job ID: {e}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The uploaded file a job operates on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionFile {
    /// Key of the assembled object in temporary storage.
    pub temp_key: String,
    /// Original filename, sanitized again before use in the permanent key.
    pub final_name_hint: String,
    /// SHA-256 hex declared by the client.
    pub declared_checksum: String,
    pub size: u64,
    pub content_type: String,
}

/// One unit of asynchronous post-upload work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionJob {
    pub job_id: JobId,
    pub form_id: String,
    pub submission_id: String,
    /// Submission field that receives the file reference.
    pub field: String,
    pub file: CompletionFile,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

/// Field name used when the upload did not name one.
pub const DEFAULT_FILE_FIELD: &str = "file";

impl CompletionJob {
    pub fn new(
        form_id: impl Into<String>,
        submission_id: impl Into<String>,
        field: Option<String>,
        file: CompletionFile,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            form_id: form_id.into(),
            submission_id: submission_id.into(),
            field: field.unwrap_or_else(|| DEFAULT_FILE_FIELD.to_string()),
            file,
            attempt: 1,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    /// Permanent storage key for the migrated object.
    ///
    /// Derived only from stable identifiers so redeliveries of the same job
    /// always target the same key.
    pub fn permanent_key(&self) -> String {
        let options = SanitizeOptions {
            append_suffix: false,
            ..SanitizeOptions::default()
        };
        format!(
            "forms/{}/submissions/{}/{}",
            key_segment(&self.form_id),
            key_segment(&self.submission_id),
            sanitize(&self.file.final_name_hint, &options)
        )
    }
}

/// Reduce an external identifier to a single safe key segment.
fn key_segment(id: &str) -> String {
    let segment: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

/// Phase of a job in the completion state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Received,
    Validating,
    Migrating,
    RecordUpdating,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Terminal failure report for a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub class: ErrorClass,
    pub message: String,
    /// Attempt on which the job gave up.
    pub attempt: u32,
}

impl JobFailure {
    /// Message shown on the submission's file field.
    ///
    /// Integrity failures and storage failures are worded differently so the
    /// form owner can tell a corrupted upload from an infrastructure problem.
    pub fn user_message(&self) -> String {
        match self.class {
            ErrorClass::IntegrityMismatch => {
                "Upload failed integrity check; the file was corrupted in transit. Please upload it again."
                    .to_string()
            }
            ErrorClass::ValidationRejected => {
                "Upload was rejected because its content does not match its declared type."
                    .to_string()
            }
            _ => "Upload could not be moved to permanent storage. It will need to be retried."
                .to_string(),
        }
    }
}
