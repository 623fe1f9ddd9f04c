//! Long-running operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::report::ReportKind;

/// Progress of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub operation_id: String,

    pub current_step: u64,

    pub total_steps: u64,

    /// Progress, from 0 to 100.
    pub percentage: f64,

    pub message: String,

    /// Free-form metadata reported by the processor.
    pub metadata: Map<String, Value>,

    pub elapsed_seconds: f64,

    pub completed: bool,

    pub failed: bool,

    /// Whether cancellation was requested.
    #[serde(default)]
    pub cancelled: bool,

    /// The error message, if the operation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A finished operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    pub operation_id: String,

    pub report: ReportKind,

    pub row_count: usize,

    pub columns: Vec<String>,

    /// Identifies this run of the computation.
    ///
    /// Changes whenever the result set is recomputed, invalidating
    /// outstanding cursors.
    pub fingerprint: String,

    pub created_at: DateTime<Utc>,
}

/// Direction to walk a result set in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Query parameters of a result page request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsQuery {
    /// Resume after the position encoded in this cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// Page size. Out-of-range values are clamped by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    /// Comma-separated list of fields to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,

    /// Ignored when a cursor is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
}

/// A page of results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResponse {
    pub items: Vec<Map<String, Value>>,

    pub pagination: PaginationInfo,

    /// Aggregates over the whole result set, regardless of projection.
    pub summary: Value,
}

/// Pagination state of a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationInfo {
    /// Pass this back to get the next page.
    pub next_cursor: Option<String>,

    pub has_more: bool,

    /// The effective page size after clamping.
    pub limit: usize,

    pub total_count: usize,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOperationResponse {
    pub operation_id: String,

    /// Whether the operation was still running when the request arrived.
    pub cancelled: bool,
}

/// Query parameters of a progress poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressQuery {
    /// Seconds to wait for the next change before answering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
}
