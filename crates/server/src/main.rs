//! Stowage server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_server::state::load_signature_table;
use stowage_server::worker::{
    CompletionProcessor, CompletionWorker, JobQueue, JobStatusBoard, MemoryQueue,
    MemoryRecordStore, RecordStore,
};
use stowage_server::{AppState, create_router};
use stowage_storage::StorageTiers;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stowage - resumable upload intake and completion server
#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "STOWAGE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Stowage v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(
            config_path = %args.config,
            "No config file found, using defaults and environment variables"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {e}");
    }

    stowage_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let tiers = StorageTiers::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(tiers = ?tiers, "Storage backends initialized");

    if !tiers.temporary.test_connection().await {
        anyhow::bail!("temporary storage is unreachable");
    }
    if !tiers.is_shared() && !tiers.permanent.test_connection().await {
        anyhow::bail!("permanent storage is unreachable");
    }
    tracing::info!("Storage connectivity verified");

    let signatures = Arc::new(
        load_signature_table(&config.validation).context("failed to load signature table")?,
    );
    tracing::info!(
        types = signatures.len(),
        strict = signatures.is_strict(),
        "File signature table loaded"
    );

    let shutdown = CancellationToken::new();
    let queue = Arc::new(MemoryQueue::new());
    let statuses = JobStatusBoard::new();
    tracing::warn!("Using the in-process job queue; queued jobs do not survive a restart");

    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let processor = Arc::new(CompletionProcessor::new(
        tiers.clone(),
        records,
        signatures.clone(),
        config.worker.clone(),
        statuses.clone(),
    ));
    let job_queue: Arc<dyn JobQueue> = queue.clone();
    let mut workers = CompletionWorker::new(job_queue.clone(), processor, config.worker.concurrency)
        .spawn(shutdown.clone());

    let state = AppState::new(config.clone(), tiers, signatures, job_queue, statuses);

    if let Some(interval) = state.rate_limit_sweep_interval() {
        stowage_server::ratelimit::spawn_sweeper(
            state.rate_limit.clone(),
            interval,
            shutdown.clone(),
        );
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Rate limiter sweep task spawned"
        );
    }

    if let Some(interval) = config.intake.session_sweep_interval() {
        stowage_server::intake::spawn_session_sweeper(
            state.sessions.clone(),
            state.tiers.temporary.clone(),
            config.intake.session_ttl(),
            config.intake.finalized_retention(),
            interval,
            shutdown.clone(),
        );
        tracing::info!(
            interval_secs = interval.as_secs(),
            ttl_secs = config.intake.session_ttl_secs,
            "Intake session sweep task spawned"
        );
    }

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;

    queue.close().await;
    let grace = config.server.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "Completion workers did not stop within the grace period"
        );
        workers.abort_all();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
