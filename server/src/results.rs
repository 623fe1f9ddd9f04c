//! Result sets of finished operations.
//!
//! A result set is immutable. Its rows are ordered once, when it is built,
//! and every run of a computation gets a fresh fingerprint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use arrears::api::v1::operation::OperationInfo;
use arrears::report::ReportKind;

/// Position of a row in the ordering of a result set.
///
/// Rows are ordered by group, then by row ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub group: String,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub key: RowKey,
    pub fields: Map<String, Value>,
}

/// The output of one run of a report.
#[derive(Debug)]
pub struct ResultSet {
    pub operation_id: String,
    pub report: ReportKind,

    /// Identifies this run.
    pub fingerprint: String,

    /// Column the rows are grouped by.
    pub sort_key: String,

    pub columns: Vec<String>,
    pub created_at: DateTime<Utc>,

    rows: Vec<ResultRow>,
    summary: Value,
}

impl ResultSet {
    pub fn new(
        operation_id: String,
        report: ReportKind,
        sort_key: String,
        columns: Vec<String>,
        mut rows: Vec<ResultRow>,
    ) -> Self {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        let summary = summarize(&columns, &rows);

        Self {
            operation_id,
            report,
            fingerprint: Uuid::new_v4().to_string(),
            sort_key,
            columns,
            created_at: Utc::now(),
            rows,
            summary,
        }
    }

    /// Returns the rows in their fixed order.
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Aggregates over every row and column.
    pub fn summary(&self) -> &Value {
        &self.summary
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            operation_id: self.operation_id.clone(),
            report: self.report,
            row_count: self.rows.len(),
            columns: self.columns.clone(),
            fingerprint: self.fingerprint.clone(),
            created_at: self.created_at,
        }
    }
}

/// Computes row count and per-column totals of numeric columns.
///
/// A column counts as numeric when every non-null cell is a number.
fn summarize(columns: &[String], rows: &[ResultRow]) -> Value {
    let mut totals = BTreeMap::new();

    'columns: for column in columns {
        let mut total = 0.0;
        let mut seen = false;

        for row in rows {
            match row.fields.get(column) {
                None | Some(Value::Null) => {}
                Some(Value::Number(n)) => {
                    total += n.as_f64().unwrap_or(0.0);
                    seen = true;
                }
                Some(_) => continue 'columns,
            }
        }

        if seen {
            totals.insert(column.clone(), total);
        }
    }

    json!({
        "total_rows": rows.len(),
        "columns": columns,
        "totals": totals,
    })
}

/// Keeps the result sets of finished operations.
#[derive(Debug)]
pub struct ResultStore {
    results: DashMap<String, Arc<ResultSet>>,
    retention: Duration,
}

impl ResultStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            results: DashMap::new(),
            retention,
        }
    }

    /// Stores a result set, replacing any earlier run of the same operation.
    pub fn insert(&self, result: Arc<ResultSet>) -> Option<Arc<ResultSet>> {
        let previous = self.results.insert(result.operation_id.clone(), result);

        if let Some(previous) = &previous {
            tracing::debug!(
                "Replaced result set {} of operation {}",
                previous.fingerprint,
                previous.operation_id
            );
        }

        previous
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<ResultSet>> {
        self.results
            .get(operation_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.results.contains_key(operation_id)
    }

    /// Drops result sets older than the retention window.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.results.len();

        self.results.retain(|_, result| match (now - result.created_at).to_std() {
            Ok(age) => age < self.retention,
            Err(_) => true,
        });

        let evicted = before.saturating_sub(self.results.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} result sets", evicted);
        }

        evicted
    }
}
