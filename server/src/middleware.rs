//! Request middleware.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use arrears::api::CORRELATION_ID_HEADER;

/// Longest correlation ID accepted from a client.
const MAX_CORRELATION_ID_LEN: usize = 128;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Per-request state.
#[derive(Debug, Clone)]
pub struct RequestState {
    /// The correlation ID of the request.
    pub correlation_id: String,
}

/// Returns the correlation ID of the request being served, if any.
pub fn correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Assigns a correlation ID to the request and echoes it back.
///
/// A well-formed ID supplied by the client is reused so that client-side
/// logs can be joined with ours.
pub async fn assign_correlation_id(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_correlation_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestState {
        correlation_id: correlation_id.clone(),
    });

    let mut response = CORRELATION_ID
        .scope(correlation_id.clone(), next.run(req))
        .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-correlation-id"), value);
    }

    response
}

fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}
