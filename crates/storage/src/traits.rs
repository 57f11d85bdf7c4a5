//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A boxed stream of bytes for streaming reads and multipart writes.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Default lifetime of presigned URLs.
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Default and maximum number of keys returned by one listing call.
pub const DEFAULT_MAX_RESULTS: usize = 1000;

/// Default part size for multipart uploads (8 MiB).
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Default number of parts in flight during a multipart upload.
pub const DEFAULT_PART_CONCURRENCY: usize = 4;

/// Metadata key under which the SHA-256 hex checksum is stored.
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

/// Maximum size for continuation tokens (2 KB).
pub const MAX_TOKEN_SIZE: usize = 2048;

/// An opaque continuation token for resuming listing operations.
///
/// This token is backend-specific and should not be parsed or modified.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    /// Create a new continuation token from raw bytes.
    ///
    /// Returns an error if the token exceeds MAX_TOKEN_SIZE.
    pub fn new(data: Vec<u8>) -> StorageResult<Self> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token too large: {} bytes (max: {})",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(Self(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        use base64::{Engine as _, engine::general_purpose};
        general_purpose::URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Parse from base64, rejecting oversized input before decoding.
    pub fn from_base64(s: &str) -> StorageResult<Self> {
        const MAX_BASE64_INPUT: usize = MAX_TOKEN_SIZE * 2;
        if s.len() > MAX_BASE64_INPUT {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token base64 too large: {} bytes (max: {})",
                s.len(),
                MAX_BASE64_INPUT
            )));
        }

        use base64::{Engine as _, engine::general_purpose};
        let data = general_purpose::URL_SAFE_NO_PAD.decode(s).map_err(|e| {
            StorageError::InvalidContinuationToken(format!(
                "invalid continuation token base64: {e}"
            ))
        })?;
        Self::new(data)
    }
}

impl fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContinuationToken")
            .field(&"<redacted>")
            .finish()
    }
}

/// Options for a listing call.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Maximum keys to return; clamped to `1..=DEFAULT_MAX_RESULTS`.
    pub max_results: Option<usize>,
    /// Token from a previous page.
    pub page_token: Option<ContinuationToken>,
}

impl ListOptions {
    pub fn with_max_results(max_results: usize) -> Self {
        Self {
            max_results: Some(max_results),
            page_token: None,
        }
    }

    pub fn normalized_max_results(&self) -> usize {
        self.max_results
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .clamp(1, DEFAULT_MAX_RESULTS)
    }
}

/// A single page of listing results.
#[derive(Clone, Debug)]
pub struct ObjectPage {
    /// Object keys in this page, in lexicographic order.
    pub keys: Vec<String>,
    /// Token for the next page, if there are more results.
    pub next_token: Option<ContinuationToken>,
}

/// Options attached to a write.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    /// User metadata stored alongside the object.
    pub metadata: BTreeMap<String, String>,
}

impl UploadOptions {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Expect the written bytes to hash to `sha256_hex`.
    ///
    /// Multipart writes fail with `ChecksumMismatch` and leave nothing behind
    /// when the streamed bytes differ.
    pub fn expect_checksum(mut self, sha256_hex: impl Into<String>) -> Self {
        self.metadata
            .insert(CHECKSUM_METADATA_KEY.to_string(), sha256_hex.into());
        self
    }
}

/// Progress of a multipart upload, reported once per completed part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartProgress {
    pub part_number: u32,
    pub part_size: u64,
    /// Bytes in all parts completed so far.
    pub bytes_uploaded: u64,
}

/// Callback invoked after each completed part.
pub type ProgressCallback = Arc<dyn Fn(PartProgress) + Send + Sync>;

/// Options for [`ObjectStore::multipart_upload`].
#[derive(Clone)]
pub struct MultipartOptions {
    /// Part size in bytes.
    pub chunk_size: usize,
    /// Parts in flight at once.
    pub concurrency: usize,
    pub on_progress: Option<ProgressCallback>,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_PART_CONCURRENCY,
            on_progress: None,
        }
    }
}

impl fmt::Debug for MultipartOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartOptions")
            .field("chunk_size", &self.chunk_size)
            .field("concurrency", &self.concurrency)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Result of a completed write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    /// Backend-specific location (`s3://bucket/key`, `file:///path`).
    pub location: String,
    pub size: u64,
    /// SHA-256 hex of the stored bytes.
    pub checksum: String,
}

/// The operation a presigned URL authorizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresignOperation {
    Read,
    Write,
}

impl PresignOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// SHA-256 hex recorded at write time, if the object was written by us.
    pub checksum: Option<String>,
    pub created_at: Option<time::OffsetDateTime>,
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Object store abstraction used by intake and the completion worker.
///
/// Writes are key-idempotent: writing the same key again overwrites it,
/// and deleting a missing key succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Store an object in one request.
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> StorageResult<UploadResult>;

    /// Store an object from a stream, split into independently uploaded parts.
    ///
    /// On failure nothing is left at `key`, so the whole call can be retried.
    async fn multipart_upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
        multipart: MultipartOptions,
    ) -> StorageResult<UploadResult>;

    /// Read an object as a byte stream.
    async fn download(&self, key: &str) -> StorageResult<ByteStream>;

    /// Delete an object. Missing keys are not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Issue a time-limited URL for reading or writing `key`.
    async fn presign(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry: Duration,
    ) -> StorageResult<String>;

    /// Server-side copy.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Object metadata without the body.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// List keys under a prefix, one page at a time.
    async fn list_objects(&self, prefix: &str, options: ListOptions) -> StorageResult<ObjectPage>;

    /// Get the name of this storage backend ("s3", "filesystem").
    fn backend_name(&self) -> &'static str;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Verify the backend is reachable with a one-key listing.
    ///
    /// Never fails: errors are logged and reported as `false`.
    async fn test_connection(&self) -> bool {
        match self
            .list_objects("", ListOptions::with_max_results(1))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    backend = self.backend_name(),
                    error = %e,
                    "storage connection test failed"
                );
                false
            }
        }
    }
}

/// Convenience helpers available on every [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    /// Download an object fully into memory.
    async fn download_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let mut stream = self.download(key).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// List every key under a prefix by following continuation tokens.
    async fn list_all(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut options = ListOptions::default();
        loop {
            let page = self.list_objects(prefix, options).await?;
            keys.extend(page.keys);
            match page.next_token {
                Some(token) => {
                    options = ListOptions {
                        max_results: None,
                        page_token: Some(token),
                    }
                }
                None => break,
            }
        }
        Ok(keys)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreExt for T {}

/// Split a byte stream into parts of exactly `part_size` bytes (the last may be shorter).
pub fn rechunk(data: ByteStream, part_size: usize) -> ByteStream {
    let part_size = part_size.max(1);
    let stream = async_stream::try_stream! {
        let mut data = data;
        let mut buf = BytesMut::with_capacity(part_size);
        while let Some(chunk) = data.next().await {
            let mut chunk = chunk?;
            while !chunk.is_empty() {
                let take = (part_size - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk.split_to(take));
                if buf.len() == part_size {
                    yield std::mem::replace(&mut buf, BytesMut::with_capacity(part_size)).freeze();
                }
            }
        }
        if !buf.is_empty() {
            yield buf.freeze();
        }
    };
    Box::pin(stream)
}

/// Wrap a single buffer as a [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}
