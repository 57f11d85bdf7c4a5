//! Health check.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: StorageHealth,
}

#[derive(Debug, Serialize)]
pub struct StorageHealth {
    pub temporary: bool,
    pub permanent: bool,
}

/// GET /v1/health - Storage connectivity. 503 when a tier is unreachable.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let temporary = state.tiers.temporary.test_connection().await;
    let permanent = if state.tiers.is_shared() {
        temporary
    } else {
        state.tiers.permanent.test_connection().await
    };

    let healthy = temporary && permanent;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            storage: StorageHealth {
                temporary,
                permanent,
            },
        }),
    )
}
