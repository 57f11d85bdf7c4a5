//! Intake preflight: run the intake validators without storing anything.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use base64::Engine;
use serde::{Deserialize, Serialize};
use stowage_core::{sanitize, validate_filename};

/// Leading bytes accepted for signature detection.
const MAX_LEADING_BYTES: usize = 4096;

#[derive(Debug, Deserialize)]
pub struct PreflightRequest {
    pub filename: String,
    pub content_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Base64 of the file's first bytes.
    #[serde(default)]
    pub leading_bytes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreflightResponse {
    /// True when intake would accept the upload.
    pub valid: bool,
    pub errors: Vec<String>,
    /// Non-blocking filename issues the sanitizer will repair.
    pub warnings: Vec<String>,
    pub sanitized_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_type: Option<String>,
}

/// POST /v1/intake/preflight
pub async fn preflight(
    State(state): State<AppState>,
    Json(req): Json<PreflightRequest>,
) -> ApiResult<Json<PreflightResponse>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let validation = validate_filename(&req.filename);
    for issue in &validation.errors {
        if issue.is_blocking() {
            errors.push(issue.as_str().to_string());
        } else {
            warnings.push(issue.as_str().to_string());
        }
    }

    if let Some(size) = req.size {
        if size == 0 {
            errors.push("empty".to_string());
        } else if size > state.config.intake.max_upload_size {
            errors.push("too_large".to_string());
        }
    }

    let mut detected_type = None;
    if let Some(encoded) = &req.leading_bytes {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ApiError::BadRequest(format!("invalid leading_bytes: {e}")))?;
        if bytes.len() > MAX_LEADING_BYTES {
            return Err(ApiError::BadRequest(format!(
                "leading_bytes is limited to {MAX_LEADING_BYTES} bytes"
            )));
        }
        detected_type = state.signatures.detect_any(&bytes).map(str::to_string);
        if !state.signatures.verify_type(&bytes, &req.content_type) {
            errors.push("signature_mismatch".to_string());
        }
    }

    Ok(Json(PreflightResponse {
        valid: errors.is_empty(),
        errors,
        warnings,
        sanitized_name: sanitize(&req.filename, &state.config.validation.sanitize),
        detected_type,
    }))
}
