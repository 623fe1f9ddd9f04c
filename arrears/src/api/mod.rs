//! HTTP API.
//!
//! Every response body is wrapped in an envelope that tells a successful
//! payload apart from a structured error.

pub mod v1;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the correlation ID of a request.
///
/// Clients may supply their own; otherwise the server generates one.
/// Either way it is echoed back on the response.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// A successful response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Always `true`.
    pub success: bool,

    /// The payload.
    pub data: T,

    /// The correlation ID of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the response was generated.
    pub timestamp: DateTime<Utc>,
}

/// A failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Always `false`.
    pub success: bool,

    pub error: ApiErrorBody,
}

/// A structured, machine-readable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    /// Machine-readable code, such as `STALE_CURSOR`.
    pub code: String,

    /// Human-readable message.
    pub message: String,

    /// The correlation ID of the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Additional error-specific details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;

        if let Some(correlation_id) = &self.correlation_id {
            write!(f, " (correlation ID {})", correlation_id)?;
        }

        Ok(())
    }
}

impl<T> ApiEnvelope<T> {
    pub fn new(data: T, correlation_id: Option<String>) -> Self {
        Self {
            success: true,
            data,
            correlation_id,
            timestamp: Utc::now(),
        }
    }
}

/// Liveness of the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,

    /// Version of the server.
    pub version: String,
}
