//! Storage wrapper that counts transfers and injects write failures.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use stowage_storage::{
    ByteStream, ListOptions, MultipartOptions, ObjectMeta, ObjectPage, ObjectStore,
    PresignOperation, StorageError, StorageResult, UploadOptions, UploadResult,
};

/// Wraps a backend, counting byte transfers. The next `n` writes
/// (multipart uploads and copies) can be made to fail with a timeout.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    failures_remaining: AtomicU32,
    multipart_uploads: AtomicU32,
    copies: AtomicU32,
    downloads: AtomicU32,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            failures_remaining: AtomicU32::new(0),
            multipart_uploads: AtomicU32::new(0),
            copies: AtomicU32::new(0),
            downloads: AtomicU32::new(0),
        }
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Successful multipart uploads plus copies.
    pub fn transfers(&self) -> u32 {
        self.multipart_uploads.load(Ordering::SeqCst) + self.copies.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, key: &str) -> StorageResult<()> {
        match self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StorageError::Timeout(format!("injected failure writing {key}"))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        self.inner.upload(key, data, options).await
    }

    async fn multipart_upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
        multipart: MultipartOptions,
    ) -> StorageResult<UploadResult> {
        self.injected_failure(key)?;
        let result = self
            .inner
            .multipart_upload(key, data, options, multipart)
            .await?;
        self.multipart_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.inner.download(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn presign(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry: Duration,
    ) -> StorageResult<String> {
        self.inner.presign(key, operation, expiry).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.injected_failure(to)?;
        self.inner.copy(from, to).await?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn list_objects(&self, prefix: &str, options: ListOptions) -> StorageResult<ObjectPage> {
        self.inner.list_objects(prefix, options).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}
