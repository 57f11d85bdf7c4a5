//! The resumable transport boundary.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use stowage_core::UploadMetadata;

/// What the server hands back once an upload is finalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    pub upload_id: String,
    /// Completion job enqueued for the upload.
    pub job_id: String,
}

/// Resumable upload protocol, independent of the wire.
///
/// A `reference` is the opaque handle returned by [`Transport::create`]; for
/// HTTP it is the upload's URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Register an upload of `size` bytes.
    async fn create(&self, metadata: &UploadMetadata, size: u64) -> Result<String>;

    /// Send `chunk` starting at `offset`. Returns the server's new offset.
    async fn send_chunk(&self, reference: &str, offset: u64, chunk: Bytes) -> Result<u64>;

    /// The server's authoritative offset.
    async fn get_offset(&self, reference: &str) -> Result<u64>;

    async fn finalize(&self, reference: &str) -> Result<FinalizeReceipt>;

    /// Drop everything the server holds for the upload.
    async fn discard(&self, reference: &str) -> Result<()>;
}
