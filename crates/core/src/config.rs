//! Configuration types shared across crates.

use crate::validate::SanitizeOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Grace period for in-flight jobs on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        path: PathBuf,
        /// Base URL under which objects are served, used for access URLs.
        public_base_url: Option<String>,
        /// HMAC secret for presigned links. Presigning is unavailable without it.
        signing_secret: Option<String>,
    },
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
            public_base_url: None,
            signing_secret: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { signing_secret, .. } => match signing_secret {
                Some(secret) if secret.len() < 16 => Err(
                    "filesystem signing_secret must be at least 16 characters".to_string(),
                ),
                _ => Ok(()),
            },
        }
    }
}

/// Temporary and permanent storage tiers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageTiersConfig {
    /// Where uploads land while in progress.
    #[serde(default)]
    pub temporary: StorageConfig,
    /// Where completed uploads are moved. Defaults to the temporary store.
    #[serde(default)]
    pub permanent: Option<StorageConfig>,
}

impl StorageTiersConfig {
    pub fn permanent(&self) -> &StorageConfig {
        self.permanent.as_ref().unwrap_or(&self.temporary)
    }

    /// Whether both tiers resolve to the same store.
    pub fn is_shared(&self) -> bool {
        self.permanent() == &self.temporary
    }

    pub fn validate(&self) -> Result<(), String> {
        self.temporary
            .validate()
            .map_err(|e| format!("storage.temporary: {e}"))?;
        if let Some(permanent) = &self.permanent {
            permanent
                .validate()
                .map_err(|e| format!("storage.permanent: {e}"))?;
        }
        Ok(())
    }
}

/// Resumable intake endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Largest declared upload length accepted, in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Largest single PATCH body accepted, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Key prefix for in-progress uploads in temporary storage.
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,
    /// Part size used when assembling uploaded chunks.
    #[serde(default = "default_assembly_part_size")]
    pub assembly_part_size: u64,
    /// Unfinished uploads idle this long are discarded with their parts.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// How long a finalized session answers repeat finalize calls.
    #[serde(default = "default_finalized_retention_secs")]
    pub finalized_retention_secs: u64,
    /// Seconds between session sweeps; 0 disables sweeping.
    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,
}

fn default_max_upload_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_temp_prefix() -> String {
    "uploads".to_string()
}

fn default_assembly_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_finalized_retention_secs() -> u64 {
    60 * 60
}

fn default_session_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_upload_size: default_max_upload_size(),
            max_chunk_size: default_max_chunk_size(),
            temp_prefix: default_temp_prefix(),
            assembly_part_size: default_assembly_part_size(),
            session_ttl_secs: default_session_ttl_secs(),
            finalized_retention_secs: default_finalized_retention_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
        }
    }
}

impl IntakeConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn finalized_retention(&self) -> Duration {
        Duration::from_secs(self.finalized_retention_secs)
    }

    /// `None` when sweeping is disabled.
    pub fn session_sweep_interval(&self) -> Option<Duration> {
        (self.session_sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.session_sweep_interval_secs))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size < crate::MIN_CHUNK_SIZE {
            return Err(format!(
                "intake.max_chunk_size must be at least {} bytes",
                crate::MIN_CHUNK_SIZE
            ));
        }
        if self.temp_prefix.trim_matches('/').is_empty() {
            return Err("intake.temp_prefix cannot be empty".to_string());
        }
        // S3 rejects multipart parts under 5 MiB (except the last).
        if self.assembly_part_size < 5 * 1024 * 1024 {
            return Err("intake.assembly_part_size must be at least 5 MiB".to_string());
        }
        Ok(())
    }
}

/// Content validation configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Options for the filename sanitizer.
    #[serde(default)]
    pub sanitize: SanitizeOptions,
    /// Optional JSON file with extra signatures merged into the built-in table.
    #[serde(default)]
    pub signature_table_path: Option<PathBuf>,
    /// Reject declared types that have no registered signature.
    #[serde(default)]
    pub strict_signatures: bool,
}

/// A single named rate limiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests allowed per window.
    pub max: u32,
}

impl LimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Selects a limiter for requests matching a method and path prefix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// HTTP method to match; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    pub path_prefix: String,
    pub limiter: String,
}

impl RouteRule {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(method))
            && path.starts_with(&self.path_prefix)
    }
}

/// Name of the limiter used when no rule matches.
pub const DEFAULT_LIMITER: &str = "api";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Proxies whose forwarded headers are trusted. IPs, CIDRs, or `*`.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum tracked identifiers per limiter before new ones are rejected.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// How often expired windows are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterConfig>,
    /// Evaluated in order; the first match wins.
    #[serde(default = "default_rules")]
    pub rules: Vec<RouteRule>,
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_limiters() -> BTreeMap<String, LimiterConfig> {
    BTreeMap::from([
        (
            "auth".to_string(),
            LimiterConfig {
                window_ms: 15 * 60 * 1000,
                max: 5,
            },
        ),
        (
            "api".to_string(),
            LimiterConfig {
                window_ms: 60 * 1000,
                max: 100,
            },
        ),
        (
            "submission".to_string(),
            LimiterConfig {
                window_ms: 60 * 1000,
                max: 10,
            },
        ),
        (
            "upload".to_string(),
            LimiterConfig {
                window_ms: 60 * 60 * 1000,
                max: 100,
            },
        ),
    ])
}

fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule {
            method: None,
            path_prefix: "/v1/auth".to_string(),
            limiter: "auth".to_string(),
        },
        RouteRule {
            method: Some("POST".to_string()),
            path_prefix: "/v1/submissions".to_string(),
            limiter: "submission".to_string(),
        },
        RouteRule {
            method: Some("POST".to_string()),
            path_prefix: "/v1/uploads".to_string(),
            limiter: "upload".to_string(),
        },
    ]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            limiters: default_limiters(),
            rules: default_rules(),
        }
    }
}

impl RateLimitConfig {
    /// Name of the limiter that governs a request.
    pub fn limiter_for(&self, method: &str, path: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.limiter.as_str())
            .unwrap_or(DEFAULT_LIMITER)
    }

    /// Validate rate limit configuration for dangerous settings.
    /// Returns warnings for configs that are insecure but allowed,
    /// and errors for configs that are unsafe and should be rejected.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !self.enabled {
            return Ok(warnings);
        }

        // Zero would panic in tokio::time::interval.
        if self.sweep_interval_secs == 0 {
            return Err("rate_limit.sweep_interval_secs cannot be 0. \
                 Use a value >= 1 second."
                .to_string());
        }

        if !self.limiters.contains_key(DEFAULT_LIMITER) {
            return Err(format!(
                "rate_limit.limiters must define the '{DEFAULT_LIMITER}' limiter"
            ));
        }

        for (name, limiter) in &self.limiters {
            if limiter.window_ms == 0 || limiter.max == 0 {
                return Err(format!(
                    "rate_limit.limiters.{name} requires window_ms > 0 and max > 0"
                ));
            }
        }

        for rule in &self.rules {
            if !self.limiters.contains_key(&rule.limiter) {
                return Err(format!(
                    "rate_limit rule for '{}' references unknown limiter '{}'",
                    rule.path_prefix, rule.limiter
                ));
            }
        }

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 This allows clients to spoof their IP address and bypass rate limits. \
                 Only use this setting in development or behind a trusted reverse proxy."
                    .to_string(),
            );
        }

        if self.max_entries < 1000 {
            warnings.push(format!(
                "rate_limit.max_entries={} is very low. \
                 Legitimate clients will be rejected once the table fills.",
                self.max_entries
            ));
        }

        Ok(warnings)
    }
}

/// Completion worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts for a storage step before the job fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout for each storage call, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Attempts for the record update. Absent or 0 retries until shutdown.
    #[serde(default = "default_record_update_max_attempts")]
    pub record_update_max_attempts: Option<u32>,
    /// Lifetime of presigned access URLs.
    #[serde(default = "default_access_url_expiry_secs")]
    pub access_url_expiry_secs: u64,
    /// Re-check the file signature before migrating.
    #[serde(default)]
    pub verify_signature: bool,
    /// When set, access URLs are `{public_base_url}/{key}` instead of presigned.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Part size for cross-store migration.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Parts in flight during cross-store migration.
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_record_update_max_attempts() -> Option<u32> {
    Some(5)
}

fn default_access_url_expiry_secs() -> u64 {
    3600
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_part_concurrency() -> usize {
    4
}

/// Longest expiry S3 accepts for a presigned URL.
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            record_update_max_attempts: default_record_update_max_attempts(),
            access_url_expiry_secs: default_access_url_expiry_secs(),
            verify_signature: false,
            public_base_url: None,
            part_size: default_part_size(),
            part_concurrency: default_part_concurrency(),
        }
    }
}

impl WorkerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn access_url_expiry(&self) -> Duration {
        Duration::from_secs(self.access_url_expiry_secs)
    }

    /// Record update attempt limit; `None` means unlimited.
    pub fn record_update_limit(&self) -> Option<u32> {
        self.record_update_max_attempts.filter(|n| *n > 0)
    }

    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();
        if self.concurrency == 0 {
            return Err("worker.concurrency must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("worker.max_attempts must be at least 1".to_string());
        }
        if self.part_concurrency == 0 {
            return Err("worker.part_concurrency must be at least 1".to_string());
        }
        if self.access_url_expiry_secs == 0 || self.access_url_expiry_secs > MAX_PRESIGN_EXPIRY_SECS
        {
            return Err(format!(
                "worker.access_url_expiry_secs must be between 1 and {MAX_PRESIGN_EXPIRY_SECS}"
            ));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            warnings.push(format!(
                "worker.base_backoff_ms={} exceeds max_backoff_ms={}; every retry will wait max_backoff_ms",
                self.base_backoff_ms, self.max_backoff_ms
            ));
        }
        if self.record_update_limit().is_none() {
            warnings.push(
                "worker.record_update_max_attempts is unlimited; a persistently failing record \
                 store will hold a worker slot until shutdown"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageTiersConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage under `path` and
    /// short worker backoff.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageTiersConfig {
                temporary: StorageConfig::Filesystem {
                    path: path.into(),
                    public_base_url: Some("http://localhost:8080/files".to_string()),
                    signing_secret: Some("test-signing-secret-0123456789".to_string()),
                },
                permanent: None,
            },
            worker: WorkerConfig {
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                ..WorkerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate every section. Returns warnings for risky settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        self.storage.validate()?;
        self.intake.validate()?;
        let mut warnings = self.rate_limit.validate()?;
        warnings.extend(self.worker.validate()?);
        if self.validation.sanitize.max_length < 16 {
            warnings.push(format!(
                "validation.sanitize.max_length={} leaves little room for a name and suffix",
                self.validation.sanitize.max_length
            ));
        }
        Ok(warnings)
    }
}
