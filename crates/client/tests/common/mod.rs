//! In-memory transport with fault injection.

// Each test file compiles this module separately.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use stowage_client::{ClientError, FinalizeReceipt, Result, Transport};
use stowage_core::UploadMetadata;

#[derive(Default)]
struct StoredUpload {
    size: u64,
    data: Vec<u8>,
    finalized: bool,
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, StoredUpload>,
    next_id: u32,
    disconnected: bool,
    /// Drop the connection once this many chunks have been stored.
    disconnect_after: Option<usize>,
    chunks_stored: usize,
    /// Fail this many sends with a timeout before storing anything.
    failing_sends: u32,
    /// Store the next chunk but report a timeout instead of the offset.
    lose_next_ack: bool,
    /// Reject every chunk with this status.
    reject_status: Option<u16>,
    /// Answer this many sends with 429 and the given `Retry-After`.
    rate_limited_sends: u32,
    rate_limit_hint: Option<Duration>,
    /// Every send that reached the server, as (offset, len).
    sends: Vec<(u64, usize)>,
    discarded: Vec<String>,
    send_delay: Option<Duration>,
}

/// A server that lives in memory.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

fn disconnected() -> ClientError {
    ClientError::Timeout(Duration::from_secs(30))
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disconnect_after(&self, chunks: usize) {
        let mut state = self.state.lock().unwrap();
        state.disconnect_after = Some(state.chunks_stored + chunks);
    }

    pub fn reconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.disconnected = false;
        state.disconnect_after = None;
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().unwrap().failing_sends = count;
    }

    pub fn lose_next_ack(&self) {
        self.state.lock().unwrap().lose_next_ack = true;
    }

    pub fn rate_limit_next_sends(&self, count: u32, retry_after: Duration) {
        let mut state = self.state.lock().unwrap();
        state.rate_limited_sends = count;
        state.rate_limit_hint = Some(retry_after);
    }

    pub fn reject_with(&self, status: u16) {
        self.state.lock().unwrap().reject_status = Some(status);
    }

    pub fn delay_sends(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = Some(delay);
    }

    /// Forget everything past `len` bytes, as a server that lost a write would.
    pub fn truncate(&self, reference: &str, len: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(upload) = state.uploads.get_mut(reference) {
            upload.data.truncate(len);
        }
    }

    pub fn data(&self, reference: &str) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .uploads
            .get(reference)
            .map(|u| u.data.clone())
            .unwrap_or_default()
    }

    pub fn stored_len(&self, reference: &str) -> usize {
        self.data(reference).len()
    }

    pub fn is_finalized(&self, reference: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.uploads.get(reference).is_some_and(|u| u.finalized)
    }

    pub fn sends(&self) -> Vec<(u64, usize)> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.state.lock().unwrap().discarded.clone()
    }

    fn store(&self, reference: &str, offset: u64, chunk: &[u8]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(disconnected());
        }
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(disconnected());
        }
        if state.rate_limited_sends > 0 {
            state.rate_limited_sends -= 1;
            return Err(ClientError::Status {
                status: 429,
                code: Some("rate_limit_exceeded".to_string()),
                message: "too many requests".to_string(),
                retry_after: state.rate_limit_hint,
            });
        }
        state.sends.push((offset, chunk.len()));
        if let Some(status) = state.reject_status {
            return Err(ClientError::Status {
                status,
                code: Some("validation_rejected".to_string()),
                message: "rejected".to_string(),
                retry_after: None,
            });
        }

        let upload = state
            .uploads
            .get_mut(reference)
            .ok_or_else(|| ClientError::Status {
                status: 404,
                code: Some("not_found".to_string()),
                message: reference.to_string(),
                retry_after: None,
            })?;
        let current = upload.data.len() as u64;
        if offset != current {
            return Err(ClientError::OffsetMismatch {
                sent: offset,
                server: current,
            });
        }
        if current + chunk.len() as u64 > upload.size {
            return Err(ClientError::Status {
                status: 400,
                code: Some("bad_request".to_string()),
                message: "chunk overruns upload".to_string(),
                retry_after: None,
            });
        }
        upload.data.extend_from_slice(chunk);
        let acked = upload.data.len() as u64;

        state.chunks_stored += 1;
        if state.disconnect_after == Some(state.chunks_stored) {
            state.disconnected = true;
        }
        if state.lose_next_ack {
            state.lose_next_ack = false;
            return Err(disconnected());
        }
        Ok(acked)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create(&self, _metadata: &UploadMetadata, size: u64) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let reference = format!("mem://uploads/{}", state.next_id);
        state.uploads.insert(
            reference.clone(),
            StoredUpload {
                size,
                ..StoredUpload::default()
            },
        );
        Ok(reference)
    }

    async fn send_chunk(&self, reference: &str, offset: u64, chunk: Bytes) -> Result<u64> {
        let delay = self.state.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.store(reference, offset, &chunk)
    }

    async fn get_offset(&self, reference: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(disconnected());
        }
        Ok(state
            .uploads
            .get(reference)
            .map(|u| u.data.len() as u64)
            .unwrap_or(0))
    }

    async fn finalize(&self, reference: &str) -> Result<FinalizeReceipt> {
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(reference)
            .ok_or_else(|| ClientError::Protocol(format!("unknown upload {reference}")))?;
        if upload.data.len() as u64 != upload.size {
            return Err(ClientError::Status {
                status: 409,
                code: Some("conflict".to_string()),
                message: "upload incomplete".to_string(),
                retry_after: None,
            });
        }
        upload.finalized = true;
        Ok(FinalizeReceipt {
            upload_id: reference.to_string(),
            job_id: format!("job-for-{reference}"),
        })
    }

    async fn discard(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(reference);
        state.discarded.push(reference.to_string());
        Ok(())
    }
}

/// Deterministic test bytes.
pub fn test_bytes(len: usize) -> Bytes {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let data: Vec<u8> = (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    Bytes::from(data)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn metadata_for(data: &[u8]) -> UploadMetadata {
    UploadMetadata {
        filename: "survey.bin".to_string(),
        filetype: "application/octet-stream".to_string(),
        form_id: "survey".to_string(),
        submission_id: "sub-9".to_string(),
        field: None,
        checksum: sha256_hex(data),
    }
}
