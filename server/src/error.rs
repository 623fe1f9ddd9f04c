//! Error handling.
//!
//! Every failure a client can observe is an `ErrorKind`. Each kind maps to
//! an HTTP status and a stable machine-readable code, and is rendered in
//! the uniform error envelope together with the request's correlation ID.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use displaydoc::Display;
use serde_json::Value;

use crate::middleware::correlation_id;
use arrears::api::v1::upload::SessionStatus;
use arrears::api::{ApiErrorBody, ApiErrorResponse};
use arrears::hash::Hash;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug)]
pub struct ServerError {
    /// The kind of the error.
    kind: ErrorKind,

    /// Extra machine-readable context for the client.
    details: Option<Value>,
}

/// The kind of an error.
#[derive(Debug, Display)]
pub enum ErrorKind {
    /// {0}
    Validation(String),

    /// {0} was not found.
    NotFound(String),

    /// The upload session is {status}, which does not allow this operation.
    InvalidState { status: SessionStatus },

    /// The upload session has already been completed.
    AlreadyCompleted,

    /// Chunk number {chunk_number} is outside of 1..={total_chunks}.
    OutOfRange { chunk_number: u32, total_chunks: u32 },

    /// The upload is incomplete: {received} of {total} chunks were received.
    Incomplete { received: u32, total: u32 },

    /// Operation {0} already exists.
    DuplicateOperation(String),

    /// Invalid pagination cursor: {0}
    InvalidCursor(String),

    /// The result set was recomputed since this cursor was issued. Restart from the first page.
    StaleCursor,

    /// Integrity check failed: Expected {expected}, got {actual}.
    Integrity { expected: Hash, actual: Hash },

    /// Invalid request: {0}
    RequestError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// The server encountered an internal error or misconfiguration.
    InternalServerError(AnyError),
}

impl ServerError {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Attaches details to the error body.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ErrorKind::Validation(message.into()).into()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ErrorKind::NotFound(what.into()).into()
    }

    pub fn storage_error(error: impl Into<AnyError>) -> Self {
        ErrorKind::StorageError(error.into()).into()
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        ErrorKind::RequestError(AnyError::new(error)).into()
    }

    pub fn internal_error(error: impl Into<AnyError>) -> Self {
        ErrorKind::InternalServerError(error.into()).into()
    }
}

impl StdError for ServerError {}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl From<ErrorKind> for ServerError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            details: None,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status_code = self.kind.http_status_code();

        if status_code.is_server_error() {
            tracing::error!("{:?}", self);
        } else {
            tracing::debug!("Request failed: {}", self.kind);
        }

        let body = ApiErrorResponse {
            success: false,
            error: ApiErrorBody {
                code: self.kind.code().to_string(),
                message: self.kind.client_message(),
                correlation_id: correlation_id(),
                details: self.details,
            },
        };

        (status_code, Json(body)).into_response()
    }
}

impl ErrorKind {
    /// Returns the machine-readable code of the error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::AlreadyCompleted => "ALREADY_COMPLETED",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::Incomplete { .. } => "INCOMPLETE",
            Self::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            Self::InvalidCursor(_) => "INVALID_CURSOR",
            Self::StaleCursor => "STALE_CURSOR",
            Self::Integrity { .. } => "INTEGRITY_ERROR",
            Self::RequestError(_) => "BAD_REQUEST",
            Self::StorageError(_) => "STORAGE_ERROR",
            Self::InternalServerError(_) => "SERVER_ERROR",
        }
    }

    pub fn http_status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::OutOfRange { .. } | Self::InvalidCursor(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. }
            | Self::AlreadyCompleted
            | Self::Incomplete { .. }
            | Self::DuplicateOperation(_) => StatusCode::CONFLICT,
            Self::StaleCursor => StatusCode::GONE,
            Self::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageError(_) | Self::InternalServerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the message shown to clients.
    ///
    /// Internal failures are not leaked.
    fn client_message(&self) -> String {
        match self {
            Self::StorageError(_) | Self::InternalServerError(_) => {
                "The server encountered an internal error.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
