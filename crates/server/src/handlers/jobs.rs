//! Completion job status.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::worker::JobStatus;
use axum::Json;
use axum::extract::{Path, State};
use stowage_core::JobId;

/// GET /v1/jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let job_id = JobId::parse(&job_id)
        .map_err(|e| ApiError::BadRequest(format!("invalid job ID: {e}")))?;
    state
        .statuses
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))
}
