//! Application state shared across handlers.

use crate::intake::IntakeSessions;
use crate::ratelimit::RateLimitState;
use crate::worker::{JobQueue, JobStatusBoard};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::config::{AppConfig, ValidationConfig};
use stowage_core::{Error, SignatureTable};
use stowage_storage::StorageTiers;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Temporary and permanent object stores.
    pub tiers: StorageTiers,
    /// File signatures checked against the first chunk of each upload.
    pub signatures: Arc<SignatureTable>,
    /// Rate limiting state.
    pub rate_limit: RateLimitState,
    /// Completion job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Completion job statuses.
    pub statuses: JobStatusBoard,
    /// Open resumable uploads.
    pub sessions: IntakeSessions,
}

impl AppState {
    /// Create a new application state.
    ///
    /// This performs configuration validation and logs warnings for potentially
    /// dangerous settings.
    ///
    /// # Panics
    ///
    /// Panics if configuration validation fails with an error.
    pub fn new(
        config: AppConfig,
        tiers: StorageTiers,
        signatures: Arc<SignatureTable>,
        queue: Arc<dyn JobQueue>,
        statuses: JobStatusBoard,
    ) -> Self {
        match config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {}", warning);
                }
            }
            Err(error) => {
                panic!("Invalid configuration: {}", error);
            }
        }

        let rate_limit = RateLimitState::new(&config.rate_limit);

        Self {
            config: Arc::new(config),
            tiers,
            signatures,
            rate_limit,
            queue,
            statuses,
            sessions: IntakeSessions::new(),
        }
    }

    /// Interval for the rate limiter sweep, if rate limiting is enabled.
    /// Falls back to 60 seconds when configured as zero.
    pub fn rate_limit_sweep_interval(&self) -> Option<Duration> {
        if !self.rate_limit.is_enabled() {
            return None;
        }
        let interval_secs = self.config.rate_limit.sweep_interval_secs;
        if interval_secs == 0 {
            tracing::warn!("rate_limit.sweep_interval_secs is 0, using default of 60 seconds");
            Some(Duration::from_secs(60))
        } else {
            Some(Duration::from_secs(interval_secs))
        }
    }
}

/// Build the signature table: the built-in signatures, extended by the
/// configured JSON file, in strict mode when configured.
pub fn load_signature_table(config: &ValidationConfig) -> stowage_core::Result<SignatureTable> {
    let mut table = SignatureTable::builtin();
    if let Some(path) = &config.signature_table_path {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::SignatureTable(format!("{}: {e}", path.display())))?;
        table = table.merge(SignatureTable::from_json(&json)?);
    }
    if config.strict_signatures {
        table = table.strict();
    }
    Ok(table)
}
