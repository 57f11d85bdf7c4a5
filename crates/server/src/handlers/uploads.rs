//! Resumable upload endpoints.
//!
//! The protocol follows tus conventions: `Upload-Length` and
//! `Upload-Metadata` on create, `Upload-Offset` on every chunk and status
//! response. Finalize is an explicit extra call that assembles the chunks and
//! enqueues the completion job.

use crate::error::{ApiError, ApiResult};
use crate::intake::{self, IntakeSession};
use crate::metrics::{
    ACTIVE_INTAKE_SESSIONS, INTAKE_BYTES_RECEIVED, INTAKE_SESSIONS_FINALIZED,
    record_validation_rejection,
};
use crate::state::AppState;
use crate::worker;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use stowage_core::{
    CompletionFile, CompletionJob, ContentHash, JobId, UploadId, UploadMetadata, sanitize,
    validate_filename,
};
use stowage_storage::UploadOptions;

pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const UPLOAD_ID: &str = "upload-id";

/// Slack for body framing beyond `intake.max_chunk_size`.
const CHUNK_UPLOAD_BUFFER: usize = 1024;

fn header_u64(headers: &HeaderMap, name: &str) -> ApiResult<u64> {
    let value = headers
        .get(name)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("invalid {name} header")))
}

fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid upload ID: {e}")))
}

fn offset_header(offset: u64) -> HeaderValue {
    HeaderValue::from(offset)
}

/// POST /v1/uploads - Open a resumable upload.
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let length = header_u64(&headers, UPLOAD_LENGTH)?;
    if length == 0 {
        return Err(ApiError::BadRequest(
            "empty uploads are not accepted".to_string(),
        ));
    }
    let max = state.config.intake.max_upload_size;
    if length > max {
        record_validation_rejection("too_large");
        return Err(ApiError::PayloadTooLarge(format!(
            "upload length {length} exceeds maximum {max}"
        )));
    }

    let raw_metadata = headers
        .get(UPLOAD_METADATA)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {UPLOAD_METADATA} header")))?;
    let metadata = UploadMetadata::from_header(raw_metadata)?;

    // Declared checksum must be SHA-256 hex.
    ContentHash::from_hex(&metadata.checksum)
        .map_err(|e| ApiError::BadRequest(format!("invalid checksum: {e}")))?;
    if metadata.form_id.trim().is_empty() || metadata.submission_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "form_id and submission_id are required".to_string(),
        ));
    }

    let blocking: Vec<_> = validate_filename(&metadata.filename).blocking().collect();
    if let Some(first) = blocking.first() {
        record_validation_rejection(first.as_str());
        tracing::info!(
            filename = %metadata.filename.escape_debug(),
            issues = ?blocking,
            "upload rejected at intake"
        );
        return Err(ApiError::InvalidFilename(blocking));
    }

    let form_id = metadata.form_id.clone();
    let submission_id = metadata.submission_id.clone();
    let id = state.sessions.insert(IntakeSession::new(length, metadata));

    tracing::info!(
        upload_id = %id,
        form_id = %form_id,
        submission_id = %submission_id,
        length,
        "Upload session created"
    );

    let location = format!("/v1/uploads/{id}");
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION.as_str(), location),
            (UPLOAD_ID, id.to_string()),
            (UPLOAD_OFFSET, "0".to_string()),
        ],
    )
        .into_response())
}

/// HEAD /v1/uploads/{upload_id} - Authoritative offset of an upload.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_upload_id(&upload_id)?;
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("upload session not found".to_string()))?;
    let session = session.lock().await;

    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(UPLOAD_OFFSET, offset_header(session.offset));
    headers.insert(UPLOAD_LENGTH, offset_header(session.length));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// PATCH /v1/uploads/{upload_id} - Append one chunk at `Upload-Offset`.
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let id = parse_upload_id(&upload_id)?;
    let offset = header_u64(req.headers(), UPLOAD_OFFSET)?;
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("upload session not found".to_string()))?;

    let max_chunk = state.config.intake.max_chunk_size as usize;
    let chunk = axum::body::to_bytes(req.into_body(), max_chunk + CHUNK_UPLOAD_BUFFER)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read chunk: {e}")))?;
    if chunk.len() > max_chunk {
        return Err(ApiError::PayloadTooLarge(format!(
            "chunk size {} exceeds maximum {max_chunk}",
            chunk.len()
        )));
    }

    let mut session = session.lock().await;
    if session.is_finalized() {
        return Err(ApiError::Conflict("upload already finalized".to_string()));
    }
    if offset != session.offset {
        return Err(ApiError::OffsetMismatch {
            expected: session.offset,
            actual: offset,
        });
    }
    let len = chunk.len() as u64;
    if offset + len > session.length {
        return Err(ApiError::BadRequest(format!(
            "chunk of {len} bytes at offset {offset} overruns upload length {}",
            session.length
        )));
    }

    if len > 0 {
        if offset == 0 && !state.signatures.verify_type(&chunk, &session.metadata.filetype) {
            record_validation_rejection("signature_mismatch");
            tracing::warn!(
                upload_id = %id,
                declared = %session.metadata.filetype,
                detected = ?state.signatures.detect_any(&chunk),
                "first chunk does not match declared type"
            );
            return Err(ApiError::UnsupportedMediaType(
                session.metadata.filetype.clone(),
            ));
        }

        let key = intake::part_key(&state.config.intake.temp_prefix, &id, offset);
        state
            .tiers
            .temporary
            .upload(
                &key,
                chunk,
                UploadOptions::with_content_type("application/octet-stream"),
            )
            .await?;
        session.parts.push(key);
        session.offset += len;
        session.touch();
        INTAKE_BYTES_RECEIVED.inc_by(len);
    }

    tracing::debug!(upload_id = %id, offset = session.offset, "Chunk stored");

    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert(UPLOAD_OFFSET, offset_header(session.offset));
    Ok(response)
}

/// Finalize response.
#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub upload_id: UploadId,
    pub job_id: JobId,
}

/// POST /v1/uploads/{upload_id}/finalize - Assemble the upload and enqueue
/// its completion job. Repeating the call returns the same job.
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FinalizeResponse>)> {
    let id = parse_upload_id(&upload_id)?;
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("upload session not found".to_string()))?;
    let mut session = session.lock().await;

    if let Some(job_id) = session.job_id {
        return Ok((
            StatusCode::ACCEPTED,
            Json(FinalizeResponse {
                upload_id: id,
                job_id,
            }),
        ));
    }
    if !session.is_complete() {
        return Err(ApiError::Conflict(format!(
            "upload incomplete: {} of {} bytes received",
            session.offset, session.length
        )));
    }

    let intake_config = &state.config.intake;
    let data_key = intake::data_key(&intake_config.temp_prefix, &id);
    let assembled = intake::assemble(
        state.tiers.temporary.clone(),
        session.parts.clone(),
        &data_key,
        &session.metadata.filetype,
        intake_config.assembly_part_size,
    )
    .await?;
    if assembled.size != session.length {
        return Err(ApiError::Internal(format!(
            "assembled {} bytes for an upload of {}",
            assembled.size, session.length
        )));
    }

    let metadata = &session.metadata;
    let job = CompletionJob::new(
        metadata.form_id.clone(),
        metadata.submission_id.clone(),
        metadata.field.clone(),
        CompletionFile {
            temp_key: data_key,
            final_name_hint: sanitize(&metadata.filename, &state.config.validation.sanitize),
            declared_checksum: metadata.checksum.to_ascii_lowercase(),
            size: session.length,
            content_type: metadata.filetype.clone(),
        },
    );
    let job_id = job.job_id;
    worker::submit(state.queue.as_ref(), &state.statuses, job).await?;

    session.job_id = Some(job_id);
    session.touch();
    let parts = std::mem::take(&mut session.parts);
    INTAKE_SESSIONS_FINALIZED.inc();
    ACTIVE_INTAKE_SESSIONS.dec();
    intake::discard_parts(state.tiers.temporary.as_ref(), &parts).await;

    tracing::info!(
        upload_id = %id,
        job_id = %job_id,
        size = session.length,
        "Upload finalized, completion job enqueued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(FinalizeResponse {
            upload_id: id,
            job_id,
        }),
    ))
}

/// DELETE /v1/uploads/{upload_id} - Discard an unfinished upload.
pub async fn discard_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_upload_id(&upload_id)?;
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("upload session not found".to_string()))?;
    let session = session.lock().await;
    if session.is_finalized() {
        return Err(ApiError::Conflict(
            "upload already finalized; its completion job owns the data".to_string(),
        ));
    }

    intake::discard_parts(state.tiers.temporary.as_ref(), &session.parts).await;
    state.sessions.remove(&id, true);

    tracing::info!(upload_id = %id, discarded_bytes = session.offset, "Upload discarded");
    Ok(StatusCode::NO_CONTENT)
}
