//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::ratelimit::rate_limit_middleware;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, head, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Storage connectivity
        .route("/v1/health", get(handlers::health_check))
        // Resumable intake
        .route("/v1/uploads", post(handlers::create_upload))
        .route(
            "/v1/uploads/{upload_id}",
            head(handlers::head_upload)
                .patch(handlers::patch_upload)
                .delete(handlers::discard_upload),
        )
        .route(
            "/v1/uploads/{upload_id}/finalize",
            post(handlers::finalize_upload),
        )
        .route("/v1/intake/preflight", post(handlers::preflight))
        // Completion jobs
        .route("/v1/jobs/{job_id}", get(handlers::get_job));

    // SECURITY: When enabled, this endpoint MUST be network-restricted
    // to authorized Prometheus scraper IPs only.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let rate_limit_state = state.rate_limit.clone();

    // Order of execution: TraceLayer -> rate limit -> handler
    router
        .layer(middleware::from_fn_with_state(
            rate_limit_state,
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
