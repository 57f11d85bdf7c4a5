//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult, is_retryable_s3_status};
use crate::traits::{
    ByteStream, CHECKSUM_METADATA_KEY, ContinuationToken, ListOptions, MultipartOptions,
    ObjectMeta, ObjectPage, ObjectStore, PartProgress, PresignOperation, UploadOptions,
    UploadResult, rechunk,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::collections::HashMap;
use std::time::Duration;
use stowage_core::ContentHash;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest object S3 can copy in a single CopyObject request.
const MAX_SINGLE_COPY_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Timeout for the connection test.
const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Markers included in lazy-credentials errors so they map to configuration
/// errors instead of generic transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "stowage-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "stowage-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    match &err {
        SdkError::TimeoutError(_) => StorageError::Timeout(err_text),
        SdkError::ConstructionFailure(_) => StorageError::Config(err_text),
        SdkError::ServiceError(service_err)
            if !is_retryable_s3_status(service_err.raw().status().as_u16()) =>
        {
            StorageError::from_s3_status(
                service_err.raw().status().as_u16(),
                format!("{:?}", service_err.err()),
            )
        }
        _ => StorageError::S3(Box::new(err)),
    }
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Normalized endpoint, kept for diagnostics.
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `force_path_style` - Use path-style URLs (`endpoint/bucket/key`) instead of
    ///   virtual-hosted style (`bucket.endpoint/key`). Required for MinIO and some
    ///   S3-compatible services.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "stowage-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        // Bare host:port endpoints (e.g. "minio:9000") get http://
        let normalized_endpoint = endpoint.as_ref().map(|endpoint_url| {
            let endpoint_lower = endpoint_url.to_lowercase();
            if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
                endpoint_url.clone()
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain HTTP endpoints get an HTTP-only client so initialization
            // doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let stored_endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{resolved_region}.amazonaws.com"),
        };

        // Strip trailing slashes to avoid keys like "prefix//key"
        let normalized_prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalized_prefix,
            endpoint: stored_endpoint,
            region: resolved_region,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let prefix_with_slash = format!("{prefix}/");
                full_key
                    .strip_prefix(&prefix_with_slash)
                    .unwrap_or(full_key)
                    .to_string()
            }
            None => full_key.to_string(),
        }
    }

    fn location(&self, full_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, full_key)
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 404
        {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    fn object_metadata(options: &UploadOptions, checksum: Option<&str>) -> HashMap<String, String> {
        let mut metadata: HashMap<String, String> = options
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(checksum) = checksum {
            metadata.insert(CHECKSUM_METADATA_KEY.to_string(), checksum.to_string());
        }
        metadata
    }

    async fn upload_part(
        &self,
        full_key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<(CompletedPart, u64)> {
        let len = data.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let part = CompletedPart::builder()
            .e_tag(output.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build();
        Ok((part, len))
    }

    async fn abort_multipart(&self, full_key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %full_key,
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }

    /// Attach the checksum to an object written without one by copying it onto itself.
    async fn attach_checksum(
        &self,
        full_key: &str,
        options: &UploadOptions,
        checksum: &str,
        size: u64,
    ) -> StorageResult<()> {
        if size > MAX_SINGLE_COPY_SIZE {
            tracing::warn!(
                key = %full_key,
                size,
                "object too large for in-place metadata update, checksum not recorded"
            );
            return Ok(());
        }
        let copy_source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(full_key, NON_ALPHANUMERIC)
        );
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(full_key)
            .copy_source(copy_source)
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(Self::object_metadata(options, Some(checksum))));
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        request.send().await.map_err(map_s3_operation_error)?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self, data, options), fields(backend = "s3", size = data.len()))]
    async fn upload(
        &self,
        key: &str,
        data: Bytes,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        let full_key = self.full_key(key);
        let checksum = ContentHash::compute(&data).to_hex();
        let size = data.len() as u64;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .set_metadata(Some(Self::object_metadata(&options, Some(&checksum))))
            .body(data.into());
        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        request.send().await.map_err(map_s3_operation_error)?;

        Ok(UploadResult {
            key: key.to_string(),
            location: self.location(&full_key),
            size,
            checksum,
        })
    }

    /// Parts are hashed in stream order and uploaded with up to
    /// `multipart.concurrency` requests in flight.
    ///
    /// When `options.metadata` already carries a `sha256`, it is stored at
    /// creation and the upload is aborted before completion if the streamed
    /// bytes hash differently.
    #[instrument(skip(self, data, options, multipart), fields(backend = "s3"))]
    async fn multipart_upload(
        &self,
        key: &str,
        data: ByteStream,
        options: UploadOptions,
        multipart: MultipartOptions,
    ) -> StorageResult<UploadResult> {
        let full_key = self.full_key(key);
        let expected = options.metadata.get(CHECKSUM_METADATA_KEY).cloned();

        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .set_metadata(Some(Self::object_metadata(&options, None)));
        if let Some(content_type) = &options.content_type {
            create = create.content_type(content_type);
        }
        let create_output = create.send().await.map_err(map_s3_operation_error)?;
        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        let part_size = multipart.chunk_size.max(MIN_PART_SIZE);
        let concurrency = multipart.concurrency.max(1);
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;
        let mut part_number = 0i32;
        let mut uploaded = 0u64;
        let mut completed: Vec<CompletedPart> = Vec::new();

        let outcome: StorageResult<()> = async {
            let mut parts = rechunk(data, part_size);
            let mut in_flight = FuturesUnordered::new();

            let mut record = |done: StorageResult<(CompletedPart, u64)>| -> StorageResult<()> {
                let (part, len) = done?;
                uploaded += len;
                if let Some(on_progress) = &multipart.on_progress {
                    on_progress(PartProgress {
                        part_number: part.part_number().unwrap_or_default() as u32,
                        part_size: len,
                        bytes_uploaded: uploaded,
                    });
                }
                completed.push(part);
                Ok(())
            };

            while let Some(part) = parts.next().await {
                let part = part?;
                part_number += 1;
                hasher.update(&part);
                size += part.len() as u64;
                in_flight.push(self.upload_part(&full_key, &upload_id, part_number, part));
                if in_flight.len() >= concurrency
                    && let Some(done) = in_flight.next().await
                {
                    record(done)?;
                }
            }
            while let Some(done) = in_flight.next().await {
                record(done)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            self.abort_multipart(&full_key, &upload_id).await;
            return Err(e);
        }

        let checksum = hasher.finalize().to_hex();
        if let Some(expected) = &expected
            && !expected.eq_ignore_ascii_case(&checksum)
        {
            self.abort_multipart(&full_key, &upload_id).await;
            return Err(StorageError::ChecksumMismatch {
                key: key.to_string(),
                expected: expected.clone(),
                actual: checksum,
            });
        }

        // Multipart uploads need at least one part, so empty objects go
        // through PutObject instead.
        if completed.is_empty() {
            self.abort_multipart(&full_key, &upload_id).await;
            return self.upload(key, Bytes::new(), options).await;
        }

        completed.sort_by_key(|p| p.part_number());
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();
        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
        {
            self.abort_multipart(&full_key, &upload_id).await;
            return Err(map_s3_operation_error(e));
        }

        if expected.is_none() {
            self.attach_checksum(&full_key, &options, &checksum, size)
                .await?;
        }

        Ok(UploadResult {
            key: key.to_string(),
            location: self.location(&full_key),
            size,
            checksum,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn download(&self, key: &str) -> StorageResult<ByteStream> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let full_key = self.full_key(key);
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match Self::map_sdk_error(e, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn presign(
        &self,
        key: &str,
        operation: PresignOperation,
        expiry: Duration,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key);
        let config = PresigningConfig::expires_in(expiry)
            .map_err(|e| StorageError::Config(format!("invalid presign expiry: {e}")))?;

        let request = match operation {
            PresignOperation::Read => self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .presigned(config)
                .await
                .map_err(map_s3_operation_error)?,
            PresignOperation::Write => self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .presigned(config)
                .await
                .map_err(map_s3_operation_error)?,
        };

        Ok(request.uri().to_string())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_full = self.full_key(from);
        let to_full = self.full_key(to);

        // CopySource is bucket/key with the key URL-encoded.
        let encoded_key = utf8_percent_encode(&from_full, NON_ALPHANUMERIC).to_string();
        let copy_source = format!("{}/{}", self.bucket, encoded_key);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(&to_full)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, from))?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::warn!(
                        key = %key,
                        timestamp = dt.secs(),
                        error = %e,
                        "Failed to convert S3 timestamp"
                    );
                })
                .ok()
        });

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            content_type: output.content_type().map(str::to_string),
            etag: output.e_tag().map(|s| s.trim_matches('"').to_string()),
            checksum: output
                .metadata()
                .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
                .cloned(),
            created_at: last_modified,
            last_modified,
        })
    }

    #[instrument(skip(self, options), fields(backend = "s3"))]
    async fn list_objects(&self, prefix: &str, options: ListOptions) -> StorageResult<ObjectPage> {
        let full_prefix = if prefix.is_empty() {
            self.prefix
                .as_ref()
                .map(|p| format!("{p}/"))
                .unwrap_or_default()
        } else {
            self.full_key(prefix)
        };

        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .max_keys(options.normalized_max_results() as i32);

        if let Some(token) = &options.page_token {
            let token = String::from_utf8(token.as_bytes().to_vec()).map_err(|e| {
                StorageError::InvalidContinuationToken(format!(
                    "invalid S3 continuation token encoding: {e}"
                ))
            })?;
            request = request.continuation_token(token);
        }

        let output = request.send().await.map_err(|e| {
            if let SdkError::ServiceError(ref service_err) = e
                && service_err.raw().status().as_u16() == 400
            {
                let body = format!("{:?}", service_err.err());
                if body.contains("continuation") || body.contains("token") {
                    return StorageError::InvalidContinuationToken(
                        "S3 rejected continuation token".to_string(),
                    );
                }
            }
            map_s3_operation_error(e)
        })?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|k| self.strip_prefix(k))
            .collect();

        let next_token = match output.next_continuation_token() {
            Some(token) if output.is_truncated() == Some(true) => {
                Some(ContinuationToken::new(token.as_bytes().to_vec())?)
            }
            _ => None,
        };

        Ok(ObjectPage { keys, next_token })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn test_connection(&self) -> bool {
        let listing = self.list_objects("", ListOptions::with_max_results(1));
        match tokio::time::timeout(CONNECTION_TEST_TIMEOUT, listing).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::error!(bucket = %self.bucket, error = %e, "S3 connection test failed");
                false
            }
            Err(_) => {
                tracing::error!(
                    bucket = %self.bucket,
                    timeout_secs = CONNECTION_TEST_TIMEOUT.as_secs(),
                    "S3 connection test timed out"
                );
                false
            }
        }
    }
}
