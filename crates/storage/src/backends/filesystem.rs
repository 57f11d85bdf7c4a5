//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, CHECKSUM_METADATA_KEY, ContinuationToken, ListOptions, MultipartOptions, ObjectMeta, ObjectPage,
    ObjectStore, PartProgress, PresignOperation, UploadOptions, UploadResult, rechunk,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stowage_core::ContentHash;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of the metadata file stored next to each object.
const SIDECAR_SUFFIX: &str = ".stowage-meta";

/// Marker embedded in in-progress write file names.
const TEMP_MARKER: &str = ".tmp.";

/// Characters left unescaped in presigned URL paths.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Metadata persisted next to an object.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: Option<String>,
    sha256: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
    public_base_url: Option<String>,
    signing_secret: Option<Vec<u8>>,
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    )
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

fn is_internal_file(name: &str) -> bool {
    name.ends_with(SIDECAR_SUFFIX) || name.contains(TEMP_MARKER)
}

impl FilesystemBackend {
    /// Create a new filesystem backend without presigning.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            public_base_url: None,
            signing_secret: None,
        })
    }

    /// Enable presigned links served under `public_base_url`.
    pub fn with_presigning(mut self, public_base_url: impl Into<String>, secret: &[u8]) -> Self {
        self.public_base_url = Some(public_base_url.into().trim_end_matches('/').to_string());
        self.signing_secret = Some(secret.to_vec());
        self
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Runs `key_path_sync` on the blocking pool since it canonicalizes paths.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Returns an error if the key would escape the storage root, including
    /// through symlinks, or collides with the backend's own bookkeeping files.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\')
        {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        if is_internal_file(key) {
            return Err(StorageError::InvalidKey(format!("reserved key name: {key}")));
        }

        for component in Path::new(key).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "contains unsafe path component: {key}"
                    )));
                }
            }
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // New path: the nearest existing ancestor must resolve inside the root,
        // otherwise create_dir_all could follow a symlinked directory out of it.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn location(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    /// Write bytes to `path` through a synced temp file and rename.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        let temp_path = temp_sibling(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, path).await?;
            Ok::<_, StorageError>(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn write_sidecar(
        path: &Path,
        options: &UploadOptions,
        checksum: &ContentHash,
    ) -> StorageResult<()> {
        let sidecar = Sidecar {
            content_type: options.content_type.clone(),
            sha256: checksum.to_hex(),
            metadata: options.metadata.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_vec(&sidecar)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        Self::write_atomic(&sidecar_path(path), &json).await
    }

    async fn read_sidecar(path: &Path) -> Option<Sidecar> {
        let data = fs::read(sidecar_path(path)).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable sidecar");
                None
            }
        }
    }

    fn signing_parts(&self) -> StorageResult<(&str, &[u8])> {
        match (&self.public_base_url, &self.signing_secret) {
            (Some(base), Some(secret)) => Ok((base.as_str(), secret.as_slice())),
            _ => Err(StorageError::PresignUnsupported(
                "filesystem backend needs public_base_url and signing_secret".to_string(),
            )),
        }
    }

    fn mac(secret: &[u8], key: &str, operation: PresignOperation, expires: i64) -> HmacSha256 {
        let mut mac = match HmacSha256::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC accepts keys of any length"),
        };
        mac.update(operation.as_str().as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    /// Check a presigned link's parameters.
    ///
    /// Returns false for expired links, wrong operations, and bad signatures.
    pub fn verify_presigned(
        &self,
        key: &str,
        operation: PresignOperation,
        expires: i64,
        signature: &str,
    ) -> bool {
        use base64::{Engine as _, engine::general_purpose};

        let Some(secret) = &self.signing_secret else {
            return false;
        };
        if OffsetDateTime::now_utc().unix_timestamp() > expires {
            return false;
        }
        let Ok(signature) = general_purpose::URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        Self::mac(secret, key, operation, expires)
            .verify_slice(&signature)
            .is_ok()
    }

    /// Collect every object key under the directory containing `prefix`.
    async fn walk(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let dir_prefix = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base_path = if dir_prefix.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_prefix).await?
        };

        let mut results = Vec::new();
        match fs::try_exists(&base_path).await {
            Ok(false) => return Ok(results),
            Ok(true) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks; symlinks are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if !is_internal_file(&key) && key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self, data, options), fields(backend = "filesystem", size = data.len()))]
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let checksum = ContentHash::compute(&data);
        Self::write_atomic(&path, &data).await?;
        Self::write_sidecar(&path, &options, &checksum).await?;

        Ok(UploadResult {
            key: key.to_string(),
            location: Self::location(&path),
            size: data.len() as u64,
            checksum: checksum.to_hex(),
        })
    }

    #[instrument(skip(self, data, options, multipart), fields(backend = "filesystem"))]
    async fn multipart_upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
        multipart: MultipartOptions,
    ) -> StorageResult<UploadResult> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = temp_sibling(&path);
        let expected = options.metadata.get(CHECKSUM_METADATA_KEY).cloned();
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut parts = rechunk(data, multipart.chunk_size);
            let mut part_number = 0u32;
            while let Some(part) = parts.next().await {
                let part = part?;
                part_number += 1;
                hasher.update(&part);
                file.write_all(&part).await?;
                size += part.len() as u64;
                if let Some(on_progress) = &multipart.on_progress {
                    on_progress(PartProgress {
                        part_number,
                        part_size: part.len() as u64,
                        bytes_uploaded: size,
                    });
                }
            }
            file.sync_all().await?;
            let checksum = hasher.finalize();
            if let Some(expected) = &expected
                && !checksum.matches_declared(expected)
            {
                return Err(StorageError::ChecksumMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual: checksum.to_hex(),
                });
            }
            fs::rename(&temp_path, &path).await?;
            Ok::<_, StorageError>(checksum)
        }
        .await;

        let checksum = match result {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };
        Self::write_sidecar(&path, &options, &checksum).await?;

        Ok(UploadResult {
            key: key.to_string(),
            location: Self::location(&path),
            size,
            checksum: checksum.to_hex(),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        for target in [sidecar_path(&path), path] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn presign(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry: Duration,
    ) -> StorageResult<String> {
        use base64::{Engine as _, engine::general_purpose};

        self.key_path(key).await?;
        let (base, secret) = self.signing_parts()?;
        let expiry_secs = i64::try_from(expiry.as_secs()).unwrap_or(i64::MAX);
        let expires = OffsetDateTime::now_utc()
            .unix_timestamp()
            .saturating_add(expiry_secs);
        let signature = general_purpose::URL_SAFE_NO_PAD
            .encode(Self::mac(secret, key, operation, expires).finalize().into_bytes());

        Ok(format!(
            "{base}/{}?op={}&expires={expires}&signature={signature}",
            utf8_percent_encode(key, KEY_ENCODE_SET),
            operation.as_str()
        ))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.key_path(from).await?;
        let to_path = self.key_path(to).await?;
        self.ensure_parent(&to_path).await?;

        let temp_path = temp_sibling(&to_path);
        if let Err(e) = fs::copy(&from_path, &temp_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(not_found_or_io(from, e));
        }
        fs::rename(&temp_path, &to_path).await?;

        match fs::read(sidecar_path(&from_path)).await {
            Ok(sidecar) => Self::write_atomic(&sidecar_path(&to_path), &sidecar).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let sidecar = Self::read_sidecar(&path).await;
        let last_modified = metadata.modified().ok().map(OffsetDateTime::from);

        Ok(ObjectMeta {
            size: metadata.len(),
            content_type: sidecar.as_ref().and_then(|s| s.content_type.clone()),
            etag: None,
            checksum: sidecar.as_ref().map(|s| s.sha256.clone()),
            created_at: sidecar.as_ref().map(|s| s.created_at).or(last_modified),
            last_modified,
        })
    }

    #[instrument(skip(self, options), fields(backend = "filesystem"))]
    async fn list_objects(&self, prefix: &str, options: ListOptions) -> StorageResult<ObjectPage> {
        let max = options.normalized_max_results();
        let after = match &options.page_token {
            Some(token) => Some(String::from_utf8(token.as_bytes().to_vec()).map_err(|_| {
                StorageError::InvalidContinuationToken("not a filesystem token".to_string())
            })?),
            None => None,
        };

        let keys = self.walk(prefix).await?;
        let mut remaining = keys
            .into_iter()
            .filter(|k| after.as_ref().is_none_or(|a| k.as_str() > a.as_str()));
        let page: Vec<String> = remaining.by_ref().take(max).collect();
        let next_token = match (remaining.next(), page.last()) {
            (Some(_), Some(last)) => Some(ContinuationToken::new(last.as_bytes().to_vec())?),
            _ => None,
        };

        Ok(ObjectPage {
            keys: page,
            next_token,
        })
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn test_connection(&self) -> bool {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                tracing::error!(root = %self.root.display(), "storage root is not a directory");
                false
            }
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "storage root not accessible");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ObjectStoreExt, bytes_stream};
    use std::sync::{Arc, Mutex};

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path())
            .await
            .unwrap()
            .with_presigning("http://localhost/files/", b"0123456789abcdef-secret");
        (dir, backend)
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let (_dir, backend) = backend().await;
        let data = Bytes::from("hello world");

        let result = backend
            .upload(
                "test/object",
                data.clone(),
                UploadOptions::with_content_type("text/plain"),
            )
            .await
            .unwrap();
        assert_eq!(result.size, 11);
        assert_eq!(result.checksum, ContentHash::compute(b"hello world").to_hex());

        assert_eq!(backend.download_bytes("test/object").await.unwrap(), data);

        let meta = backend.head("test/object").await.unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
        assert_eq!(meta.checksum.as_deref(), Some(result.checksum.as_str()));
    }

    #[tokio::test]
    async fn test_multipart_reports_progress_per_part() {
        let (_dir, backend) = backend().await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();

        let result = backend
            .multipart_upload(
                "big/object",
                bytes_stream(Bytes::from(data.clone())),
                UploadOptions::default(),
                MultipartOptions {
                    chunk_size: 4096,
                    concurrency: 2,
                    on_progress: Some(Arc::new(move |p| seen_cb.lock().unwrap().push(p))),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.size, 10_000);
        assert_eq!(result.checksum, ContentHash::compute(&data).to_hex());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].bytes_uploaded, 10_000);
        assert_eq!(seen[2].part_size, 10_000 - 2 * 4096);
    }

    #[tokio::test]
    async fn test_multipart_failure_leaves_nothing() {
        let (dir, backend) = backend().await;
        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StorageError::Timeout("source".to_string())),
        ]));
        let result = backend
            .multipart_upload(
                "broken/object",
                failing,
                UploadOptions::default(),
                MultipartOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert!(!backend.exists("broken/object").await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("broken"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, backend) = backend().await;
        backend
            .upload("k", Bytes::from("v"), UploadOptions::default())
            .await
            .unwrap();
        backend.delete("k").await.unwrap();
        backend.delete("k").await.unwrap();
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_preserves_checksum() {
        let (_dir, backend) = backend().await;
        backend
            .upload("a/src", Bytes::from("payload"), UploadOptions::default())
            .await
            .unwrap();
        backend.copy("a/src", "b/dst").await.unwrap();

        let src = backend.head("a/src").await.unwrap();
        let dst = backend.head("b/dst").await.unwrap();
        assert_eq!(src.checksum, dst.checksum);
        assert!(matches!(
            backend.copy("missing", "b/other").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_objects_paginates_and_hides_sidecars() {
        let (_dir, backend) = backend().await;
        for key in ["p/a", "p/b", "p/c", "q/d"] {
            backend
                .upload(key, Bytes::from("x"), UploadOptions::default())
                .await
                .unwrap();
        }

        let first = backend
            .list_objects("p/", ListOptions::with_max_results(2))
            .await
            .unwrap();
        assert_eq!(first.keys, vec!["p/a", "p/b"]);
        let token = first.next_token.expect("more pages");

        let second = backend
            .list_objects(
                "p/",
                ListOptions {
                    max_results: Some(2),
                    page_token: Some(token),
                },
            )
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["p/c"]);
        assert!(second.next_token.is_none());

        assert_eq!(backend.list_all("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_presign_and_verify() {
        let (_dir, backend) = backend().await;
        let url = backend
            .presign(
                "forms/1/my file.pdf",
                PresignOperation::Read,
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost/files/forms/1/my%20file.pdf?op=read&expires="));

        let query = url.split_once('?').unwrap().1;
        let params: BTreeMap<&str, &str> = query
            .split('&')
            .filter_map(|p| p.split_once('='))
            .collect();
        let expires: i64 = params["expires"].parse().unwrap();
        let signature = params["signature"];

        assert!(backend.verify_presigned(
            "forms/1/my file.pdf",
            PresignOperation::Read,
            expires,
            signature
        ));
        assert!(!backend.verify_presigned(
            "forms/1/my file.pdf",
            PresignOperation::Write,
            expires,
            signature
        ));
        assert!(!backend.verify_presigned("forms/1/other.pdf", PresignOperation::Read, expires, signature));
        assert!(!backend.verify_presigned(
            "forms/1/my file.pdf",
            PresignOperation::Read,
            expires - 3600,
            signature
        ));
    }

    #[tokio::test]
    async fn test_presign_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        assert!(matches!(
            backend
                .presign("k", PresignOperation::Read, Duration::from_secs(60))
                .await,
            Err(StorageError::PresignUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, backend) = backend().await;
        assert!(backend.head("../escape").await.is_err());
        assert!(backend.head("/absolute/path").await.is_err());
        assert!(backend.head("foo/../../etc/passwd").await.is_err());
        assert!(backend.head("obj.stowage-meta").await.is_err());
        assert!(matches!(
            backend.head("valid/nested/key").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_ancestor_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let (dir, backend) = backend().await;
        let outside_dir = tempfile::tempdir().unwrap();
        symlink(outside_dir.path(), dir.path().join("escape")).unwrap();

        let result = backend
            .upload(
                "escape/nested/file.txt",
                Bytes::from("data"),
                UploadOptions::default(),
            )
            .await;
        match result {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey error, got: {other:?}"),
        }
        assert!(!outside_dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn test_connection_reports_missing_root() {
        let (dir, backend) = backend().await;
        assert!(backend.test_connection().await);
        drop(dir);
        assert!(!backend.test_connection().await);
    }
}
