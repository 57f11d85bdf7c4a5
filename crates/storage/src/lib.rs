//! Object storage for uploaded files.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait: streamed multipart writes, reads, deletes,
//!   copies, presigned URLs and paginated listing
//! - Backends: local filesystem and S3-compatible
//! - [`StorageTiers`]: the temporary and permanent stores used by the pipeline

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, ContinuationToken, ListOptions, MultipartOptions, ObjectMeta, ObjectPage,
    ObjectStore, ObjectStoreExt, PartProgress, PresignOperation, ProgressCallback, UploadOptions,
    UploadResult, bytes_stream, rechunk,
};

use std::sync::Arc;
use stowage_core::config::{StorageConfig, StorageTiersConfig};

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem {
            path,
            public_base_url,
            signing_secret,
        } => {
            let mut backend = FilesystemBackend::new(path).await?;
            if let (Some(base), Some(secret)) = (public_base_url, signing_secret) {
                backend = backend.with_presigning(base.clone(), secret.as_bytes());
            }
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Temporary and permanent stores.
///
/// Both handles point at the same backend when no permanent store is configured.
#[derive(Clone)]
pub struct StorageTiers {
    pub temporary: Arc<dyn ObjectStore>,
    pub permanent: Arc<dyn ObjectStore>,
}

impl StorageTiers {
    pub fn new(temporary: Arc<dyn ObjectStore>, permanent: Arc<dyn ObjectStore>) -> Self {
        Self {
            temporary,
            permanent,
        }
    }

    /// Use one store for both tiers.
    pub fn shared(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            temporary: store.clone(),
            permanent: store,
        }
    }

    /// Build both tiers from configuration.
    pub async fn from_config(config: &StorageTiersConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;
        let temporary = from_config(&config.temporary).await?;
        if config.is_shared() {
            return Ok(Self::shared(temporary));
        }
        let permanent = from_config(config.permanent()).await?;
        Ok(Self::new(temporary, permanent))
    }

    /// Whether both tiers use the same backend instance.
    pub fn is_shared(&self) -> bool {
        Arc::ptr_eq(&self.temporary, &self.permanent)
    }
}

impl std::fmt::Debug for StorageTiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTiers")
            .field("temporary", &self.temporary.backend_name())
            .field("permanent", &self.permanent.backend_name())
            .field("shared", &self.is_shared())
            .finish()
    }
}
