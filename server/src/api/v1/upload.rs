use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection, PathRejection},
        Extension, Json, Path,
    },
    http::{HeaderMap, StatusCode},
};
use tracing::instrument;
use uuid::Uuid;

use crate::api::ApiResponse;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::middleware::RequestState;
use crate::State;
use arrears::api::v1::upload::{
    CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest, InitiateUploadResponse,
    UploadChunkResponse, UploadStatus, ARREARS_CHUNK_HASH,
};
use arrears::hash::Hash;

/// Opens an upload session.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn initiate_upload(
    Extension(state): Extension<State>,
    payload: Result<Json<InitiateUploadRequest>, JsonRejection>,
) -> ServerResult<ApiResponse<InitiateUploadResponse>> {
    let Json(request) = payload.map_err(ServerError::request_error)?;

    let handle = state.uploads.initiate(
        &request.filename,
        request.total_size,
        request.total_chunks,
        request.sha256,
    )?;

    Ok(ApiResponse::created(InitiateUploadResponse {
        session_id: handle.session_id,
        chunk_size: handle.chunk_size,
        expires_at: handle.expires_at,
    }))
}

/// Uploads a single chunk.
///
/// The body is the raw chunk. Its hash may be provided via a header, in
/// which case the chunk is verified before it is stored.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn upload_chunk(
    Extension(state): Extension<State>,
    path: Result<Path<(String, u32)>, PathRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ServerResult<ApiResponse<UploadChunkResponse>> {
    let Path((session_id, chunk_number)) = path.map_err(ServerError::request_error)?;
    let body = body.map_err(body_rejection)?;

    let expected_hash = headers
        .get(ARREARS_CHUNK_HASH)
        .map(|value| {
            let value = value
                .to_str()
                .map_err(|_| ErrorKind::RequestError(anyhow!("Invalid chunk hash header")))?;

            Hash::from_typed(value).map_err(|e| {
                ServerError::from(ErrorKind::RequestError(anyhow!(
                    "Invalid chunk hash format: {}",
                    e
                )))
            })
        })
        .transpose()?;

    let ack = state
        .uploads
        .put_chunk(&session_id, chunk_number, body, expected_hash)
        .await?;

    Ok(ApiResponse::ok(UploadChunkResponse {
        chunk_number: ack.chunk_number,
        chunks_received: ack.chunks_received,
        chunks_remaining: ack.chunks_remaining,
        percentage: ack.percentage,
    }))
}

/// Assembles an upload and launches processing.
///
/// Returns as soon as processing has started. The operation ID in the
/// response is used to follow it.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn complete_upload(
    Extension(state): Extension<State>,
    Extension(req_state): Extension<RequestState>,
    path: Result<Path<String>, PathRejection>,
    payload: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> ServerResult<ApiResponse<CompleteUploadResponse>> {
    let Path(session_id) = path.map_err(ServerError::request_error)?;
    let Json(request) = payload.map_err(ServerError::request_error)?;

    let file = state.uploads.complete(&session_id).await?;

    let operation_id = Uuid::new_v4().to_string();
    let response = CompleteUploadResponse {
        operation_id: operation_id.clone(),
        session_id: file.session_id.clone(),
        filename: file.filename.clone(),
        size: file.data.len() as u64,
        sha256: file.sha256,
    };

    tracing::info!(
        "Request {} launched operation {} for session {}",
        req_state.correlation_id,
        operation_id,
        session_id
    );

    // Processing outlives the request. Its outcome is reported through
    // the progress record.
    let _processing = state
        .coordinator
        .submit(file, request.report, &operation_id)?;

    Ok(ApiResponse::accepted(response))
}

/// Cancels an upload session.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn cancel_upload(
    Extension(state): Extension<State>,
    path: Result<Path<String>, PathRejection>,
) -> ServerResult<StatusCode> {
    let Path(session_id) = path.map_err(ServerError::request_error)?;

    state.uploads.cancel(&session_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Returns the status of an upload session.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn get_upload_status(
    Extension(state): Extension<State>,
    path: Result<Path<String>, PathRejection>,
) -> ServerResult<ApiResponse<UploadStatus>> {
    let Path(session_id) = path.map_err(ServerError::request_error)?;

    Ok(ApiResponse::ok(state.uploads.status(&session_id).await?))
}

fn body_rejection(rejection: BytesRejection) -> ServerError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::validation("Chunk exceeds the maximum chunk size")
    } else {
        ServerError::request_error(rejection)
    }
}
