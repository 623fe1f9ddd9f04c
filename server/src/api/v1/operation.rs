use std::time::Duration;

use axum::extract::{
    rejection::{PathRejection, QueryRejection},
    Extension, Path, Query,
};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::instrument;

use crate::api::ApiResponse;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::pagination::{etag_matches, page_etag, parse_fields};
use crate::State;
use arrears::api::v1::operation::{
    CancelOperationResponse, OperationInfo, PageResponse, ProgressQuery, ProgressResponse,
    ResultsQuery,
};

/// Returns the progress of an operation.
///
/// With `wait`, the answer is held back until the progress changes or the
/// wait runs out, whichever comes first.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn get_progress(
    Extension(state): Extension<State>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<ProgressQuery>, QueryRejection>,
) -> ServerResult<ApiResponse<ProgressResponse>> {
    let Path(operation_id) = path.map_err(ServerError::request_error)?;
    let Query(query) = query.map_err(ServerError::request_error)?;

    let wait = query
        .wait
        .unwrap_or(0)
        .min(state.config.progress.max_wait_secs);

    if wait > 0 {
        let mut updates = state
            .progress
            .subscribe(&operation_id)
            .map_err(|e| progress_not_found(&state, &operation_id, e))?;

        if !updates.borrow_and_update().is_terminal() {
            // Timing out just means nothing changed.
            let _ = tokio::time::timeout(Duration::from_secs(wait), updates.changed()).await;
        }
    }

    let record = state
        .progress
        .read(&operation_id)
        .map_err(|e| progress_not_found(&state, &operation_id, e))?;

    Ok(ApiResponse::ok(record.to_response()))
}

/// Requests cancellation of an operation.
///
/// Best effort. A processor that already finished keeps its outcome.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn cancel_operation(
    Extension(state): Extension<State>,
    path: Result<Path<String>, PathRejection>,
) -> ServerResult<ApiResponse<CancelOperationResponse>> {
    let Path(operation_id) = path.map_err(ServerError::request_error)?;

    let cancelled = state.progress.cancel(&operation_id)?;

    Ok(ApiResponse::accepted(CancelOperationResponse {
        operation_id,
        cancelled,
    }))
}

/// Looks up a completed operation.
///
/// Works after its progress record was evicted, for as long as the result
/// is retained.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn get_operation(
    Extension(state): Extension<State>,
    path: Result<Path<String>, PathRejection>,
) -> ServerResult<ApiResponse<OperationInfo>> {
    let Path(operation_id) = path.map_err(ServerError::request_error)?;

    let result = state
        .results
        .get(&operation_id)
        .ok_or_else(|| ServerError::not_found(format!("Result of operation {}", operation_id)))?;

    Ok(ApiResponse::ok(result.info()))
}

/// Returns a page of an operation's result.
///
/// Pages carry an `ETag`. A request whose `If-None-Match` still matches gets
/// `304 Not Modified` without a body.
#[instrument(skip_all)]
#[axum::debug_handler]
pub(crate) async fn get_results(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> ServerResult<Response> {
    let Path(operation_id) = path.map_err(ServerError::request_error)?;
    let Query(query) = query.map_err(ServerError::request_error)?;

    let result = state.results.get(&operation_id).ok_or_else(|| {
        let error = ServerError::not_found(format!("Result of operation {}", operation_id));

        match state.progress.read(&operation_id) {
            Ok(record) if !record.is_terminal() => error.with_details(json!({
                "processing": true,
                "percentage": record.percentage,
            })),
            _ => error,
        }
    })?;

    let fields = parse_fields(query.fields.as_deref());
    let order = query.order.unwrap_or_default();
    let page = state.paginator.page(
        &result,
        query.cursor.as_deref(),
        query.limit,
        &fields,
        order,
    )?;

    let etag = page_etag(&result, query.cursor.as_deref(), page.limit, &fields, order);
    let cache_headers = [
        (header::ETAG, etag.clone()),
        (header::CACHE_CONTROL, "private, no-cache".to_string()),
    ];

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| etag_matches(value, &etag));

    if not_modified {
        return Ok((StatusCode::NOT_MODIFIED, cache_headers).into_response());
    }

    let body: ApiResponse<PageResponse> =
        ApiResponse::ok(page.into_response(result.summary().clone()));
    Ok((cache_headers, body).into_response())
}

/// Tells a client whose progress record is gone whether the result is still there.
fn progress_not_found(state: &State, operation_id: &str, error: ServerError) -> ServerError {
    match error.kind() {
        ErrorKind::NotFound(_) if state.results.contains(operation_id) => {
            error.with_details(json!({ "result_available": true }))
        }
        _ => error,
    }
}
