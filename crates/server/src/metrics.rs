//! Prometheus metrics for the stowage server.
//!
//! Covers intake sessions, validation rejections, rate-limit denials and
//! completion jobs.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no form, submission or file identifiers, but they do expose
//! aggregate volume. Restrict the endpoint to scraper IPs at the network layer.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Intake metrics
pub static INTAKE_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_intake_sessions_created_total",
        "Total number of resumable upload sessions created",
    )
    .expect("metric creation failed")
});

pub static INTAKE_SESSIONS_FINALIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_intake_sessions_finalized_total",
        "Total number of upload sessions finalized and enqueued",
    )
    .expect("metric creation failed")
});

pub static INTAKE_BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_intake_bytes_received_total",
        "Total bytes accepted by the intake endpoints",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_INTAKE_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stowage_active_intake_sessions",
        "Current number of open upload sessions",
    )
    .expect("metric creation failed")
});

pub static VALIDATION_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_validation_rejections_total",
            "Uploads rejected at intake, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

// Rate limiting
pub static RATE_LIMIT_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_rate_limit_denials_total",
            "Requests denied by the rate governor, by limiter",
        ),
        &["limiter"],
    )
    .expect("metric creation failed")
});

// Completion worker metrics
pub static JOBS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_jobs_completed_total",
        "Total completion jobs that reached Completed",
    )
    .expect("metric creation failed")
});

pub static JOBS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_jobs_failed_total",
            "Completion jobs that failed terminally, by error class",
        ),
        &["class"],
    )
    .expect("metric creation failed")
});

pub static JOB_RETRIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_job_retries_total",
            "Retried worker steps, by step",
        ),
        &["step"],
    )
    .expect("metric creation failed")
});

pub static REDELIVERIES_SHORT_CIRCUITED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_redeliveries_short_circuited_total",
        "Redelivered jobs whose destination already held the file",
    )
    .expect("metric creation failed")
});

pub static JOB_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "stowage_job_duration_seconds",
            "Time from receiving a completion job to its terminal phase",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// This function is idempotent - subsequent calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(INTAKE_SESSIONS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INTAKE_SESSIONS_FINALIZED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INTAKE_BYTES_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_INTAKE_SESSIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VALIDATION_REJECTIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RATE_LIMIT_DENIALS.clone()))
            .expect("metric registration failed");

        // Worker metrics
        REGISTRY
            .register(Box::new(JOBS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REDELIVERIES_SHORT_CIRCUITED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOB_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

pub fn record_validation_rejection(reason: &str) {
    VALIDATION_REJECTIONS.with_label_values(&[reason]).inc();
}

pub fn record_rate_limit_denial(limiter: &str) {
    RATE_LIMIT_DENIALS.with_label_values(&[limiter]).inc();
}

pub fn record_job_failure(class: &str) {
    JOBS_FAILED.with_label_values(&[class]).inc();
}

pub fn record_job_retry(step: &str) {
    JOB_RETRIES.with_label_values(&[step]).inc();
}
