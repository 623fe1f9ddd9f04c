mod operation;
mod upload;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};

use crate::config::Config;

pub(crate) fn get_router(config: &Config) -> Router {
    let max_chunk_size =
        usize::try_from(config.chunked_upload.max_chunk_size).unwrap_or(usize::MAX);

    Router::new()
        .route("/_api/v1/uploads", post(upload::initiate_upload))
        .route(
            "/_api/v1/uploads/{session_id}",
            get(upload::get_upload_status).delete(upload::cancel_upload),
        )
        .route(
            "/_api/v1/uploads/{session_id}/chunks/{chunk_number}",
            put(upload::upload_chunk).layer(DefaultBodyLimit::max(max_chunk_size)),
        )
        .route(
            "/_api/v1/uploads/{session_id}/complete",
            post(upload::complete_upload),
        )
        .route(
            "/_api/v1/operations/{operation_id}",
            get(operation::get_operation).delete(operation::cancel_operation),
        )
        .route(
            "/_api/v1/operations/{operation_id}/progress",
            get(operation::get_progress),
        )
        .route(
            "/_api/v1/operations/{operation_id}/results",
            get(operation::get_results),
        )
}
