//! Resumable upload session types and lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::UploadSession(format!("invalid upload ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-side upload session status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Created but not started.
    Idle,
    /// Chunks are being sent.
    Uploading,
    /// Suspended by the user; offset retained.
    Paused,
    /// Every byte acknowledged and finalization confirmed.
    Completed,
    /// Gave up after an unrecoverable error; offset retained.
    Failed,
    /// Explicitly cancelled; server-side bytes discarded.
    Cancelled,
}

impl UploadStatus {
    /// Check if the session can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Idle | Self::Uploading | Self::Paused)
    }

    /// Check if the session reached a terminal state.
    ///
    /// `Failed` is not terminal: a later resume may pick the transfer up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The file being transferred.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Original file name as chosen by the user.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared MIME type.
    pub mime_type: String,
}

/// Progress snapshot emitted after each acknowledged chunk.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
}

impl UploadProgress {
    pub fn new(loaded: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64) * 100.0
        };
        Self {
            loaded,
            total,
            percentage,
        }
    }
}

/// Retry bookkeeping for the chunk currently being sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed attempts for the current chunk.
    pub attempt: u32,
    /// Delay before the next attempt, in milliseconds.
    pub next_delay_ms: Option<u64>,
}

/// An upload session tracking resumable upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier, generated client-side.
    pub id: UploadId,
    /// The file being uploaded.
    pub file: FileDescriptor,
    /// Chunk size for this session.
    pub chunk_size: u64,
    /// Bytes acknowledged by the server.
    pub offset: u64,
    /// Current status.
    pub status: UploadStatus,
    /// Retry bookkeeping.
    #[serde(default)]
    pub retry_state: RetryState,
    /// Resumable reference returned by the server on creation.
    pub upload_url: Option<String>,
}

impl UploadSession {
    /// Create a new idle session.
    pub fn new(file: FileDescriptor, chunk_size: u64) -> crate::Result<Self> {
        if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(crate::Error::InvalidChunkSize {
                size: chunk_size,
                min: crate::MIN_CHUNK_SIZE,
                max: crate::MAX_CHUNK_SIZE,
            });
        }
        Ok(Self {
            id: UploadId::new(),
            file,
            chunk_size,
            offset: 0,
            status: UploadStatus::Idle,
            retry_state: RetryState::default(),
            upload_url: None,
        })
    }

    /// Bytes still to be acknowledged.
    pub fn remaining(&self) -> u64 {
        self.file.size.saturating_sub(self.offset)
    }

    /// Byte range of the next chunk to send.
    pub fn next_range(&self) -> std::ops::Range<u64> {
        let end = (self.offset + self.chunk_size).min(self.file.size);
        self.offset..end
    }

    /// Whether every byte has been acknowledged.
    pub fn is_fully_acknowledged(&self) -> bool {
        self.offset == self.file.size
    }

    /// Record an acknowledged offset for a chunk sent at `sent_from`.
    ///
    /// The acknowledgment may be short (fewer bytes than sent) but must not
    /// move backwards or past the end of the file.
    pub fn acknowledge(&mut self, sent_from: u64, sent_len: u64, acked: u64) -> crate::Result<()> {
        if acked < sent_from || acked > sent_from + sent_len || acked > self.file.size {
            return Err(crate::Error::UploadSession(format!(
                "server acknowledged offset {acked} for a chunk at {sent_from} of {sent_len} bytes (size {})",
                self.file.size
            )));
        }
        self.offset = self.offset.max(acked);
        Ok(())
    }

    /// Current progress.
    pub fn progress(&self) -> UploadProgress {
        UploadProgress::new(self.offset, self.file.size)
    }
}

/// Metadata attached to an upload at creation time.
///
/// Travels in the `Upload-Metadata` header as comma-separated
/// `key base64(value)` pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub filename: String,
    pub filetype: String,
    pub form_id: String,
    pub submission_id: String,
    /// Submission field the file belongs to.
    pub field: Option<String>,
    /// Declared SHA-256 checksum (hex).
    pub checksum: String,
}

impl UploadMetadata {
    /// Encode as an `Upload-Metadata` header value.
    pub fn to_header(&self) -> String {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        let mut pairs = vec![
            ("filename", self.filename.as_str()),
            ("filetype", self.filetype.as_str()),
            ("form_id", self.form_id.as_str()),
            ("submission_id", self.submission_id.as_str()),
            ("checksum", self.checksum.as_str()),
        ];
        if let Some(field) = &self.field {
            pairs.push(("field", field.as_str()));
        }
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k} {}", engine.encode(v)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Decode an `Upload-Metadata` header value.
    pub fn from_header(header: &str) -> crate::Result<Self> {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        let mut values = BTreeMap::new();
        for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, encoded) = match pair.split_once(' ') {
                Some((k, v)) => (k, v.trim()),
                None => (pair, ""),
            };
            let decoded = engine
                .decode(encoded)
                .map_err(|e| crate::Error::UploadSession(format!("metadata {key}: {e}")))?;
            let value = String::from_utf8(decoded)
                .map_err(|e| crate::Error::UploadSession(format!("metadata {key}: {e}")))?;
            values.insert(key.to_string(), value);
        }

        let mut take = |key: &str| {
            values
                .remove(key)
                .ok_or_else(|| crate::Error::UploadSession(format!("missing metadata: {key}")))
        };
        Ok(Self {
            filename: take("filename")?,
            filetype: take("filetype")?,
            form_id: take("form_id")?,
            submission_id: take("submission_id")?,
            checksum: take("checksum")?,
            field: values.remove("field"),
        })
    }
}
