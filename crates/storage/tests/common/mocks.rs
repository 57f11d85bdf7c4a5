use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stowage_storage::error::{StorageError, StorageResult};
use stowage_storage::traits::{
    ByteStream, ListOptions, MultipartOptions, ObjectMeta, ObjectPage, ObjectStore,
    PresignOperation, UploadOptions, UploadResult,
};

/// Wraps a backend, counting calls and optionally failing the first writes
/// with a transient error.
#[allow(dead_code)]
pub struct InstrumentedBackend {
    inner: Arc<dyn ObjectStore>,
    pub uploads: AtomicUsize,
    pub multipart_uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub deletes: AtomicUsize,
    pub copies: AtomicUsize,
    fail_writes: AtomicUsize,
}

#[allow(dead_code)]
impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Arc<Self> {
        Self::failing_writes(inner, 0)
    }

    /// Fail the next `count` upload, multipart or copy calls with a timeout.
    pub fn failing_writes(inner: Arc<dyn ObjectStore>, count: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            uploads: AtomicUsize::new(0),
            multipart_uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
            fail_writes: AtomicUsize::new(count),
        })
    }

    pub fn writes(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
            + self.multipart_uploads.load(Ordering::SeqCst)
            + self.copies.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> StorageResult<()> {
        let remaining = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(StorageError::Timeout("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStore for InstrumentedBackend {
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.inner.upload(key, data, options).await
    }

    async fn multipart_upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
        multipart: MultipartOptions,
    ) -> StorageResult<UploadResult> {
        self.multipart_uploads.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.inner
            .multipart_upload(key, data, options, multipart)
            .await
    }

    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.inner.download(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
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
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.inner.copy(from, to).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn list_objects(&self, prefix: &str, options: ListOptions) -> StorageResult<ObjectPage> {
        self.inner.list_objects(prefix, options).await
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
