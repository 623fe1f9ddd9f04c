//! Progress tracking for long-running operations.
//!
//! Every operation owns one record. The processor is the single writer and
//! publishes whole new records, so pollers always read a consistent
//! snapshot without taking a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::{ErrorKind, ServerError, ServerResult};
use arrears::api::v1::operation::ProgressResponse;

/// Error message of an operation that was cancelled.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// A snapshot of an operation's progress.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub operation_id: String,
    pub total_steps: u64,
    pub current_step: u64,

    /// Progress, from 0 to 100 with two decimals.
    pub percentage: f64,

    pub message: String,
    pub metadata: Map<String, Value>,
    pub started_at: DateTime<Utc>,

    /// When the operation completed or failed.
    pub finished_at: Option<DateTime<Utc>>,

    pub completed: bool,
    pub failed: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl ProgressRecord {
    fn new(operation_id: String, total_steps: u64) -> Self {
        Self {
            operation_id,
            total_steps,
            current_step: 0,
            percentage: 0.0,
            message: String::new(),
            metadata: Map::new(),
            started_at: Utc::now(),
            finished_at: None,
            completed: false,
            failed: false,
            cancelled: false,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }

    /// Returns the seconds since the operation started.
    ///
    /// The clock stops once the operation is finished.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        let end = self.finished_at.unwrap_or(now);
        let elapsed = end - self.started_at;

        elapsed.num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn to_response(&self) -> ProgressResponse {
        ProgressResponse {
            operation_id: self.operation_id.clone(),
            current_step: self.current_step,
            total_steps: self.total_steps,
            percentage: self.percentage,
            message: self.message.clone(),
            metadata: self.metadata.clone(),
            elapsed_seconds: self.elapsed_seconds(Utc::now()),
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            error: self.error.clone(),
        }
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Debug)]
struct ProgressEntry {
    record: ArcSwap<ProgressRecord>,
    notify: watch::Sender<Arc<ProgressRecord>>,
    cancel_requested: AtomicBool,
}

impl ProgressEntry {
    fn new(record: ProgressRecord) -> Self {
        let record = Arc::new(record);
        let (notify, _) = watch::channel(record.clone());

        Self {
            record: ArcSwap::new(record),
            notify,
            cancel_requested: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Arc<ProgressRecord> {
        self.record.load_full()
    }

    /// Publishes the record returned by `f`.
    ///
    /// `f` may run more than once if another writer races this one.
    /// Returning `None` leaves the record untouched. Returns whether a new
    /// record was published.
    fn publish<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&ProgressRecord) -> Option<ProgressRecord>,
    {
        let mut published = false;

        self.record.rcu(|current| match f(&**current) {
            Some(next) => {
                published = true;
                Arc::new(next)
            }
            None => {
                published = false;
                current.clone()
            }
        });

        if published {
            self.notify.send_replace(self.snapshot());
        }

        published
    }
}

/// Tracks the progress of every live operation.
#[derive(Debug)]
pub struct ProgressTracker {
    entries: DashMap<String, Arc<ProgressEntry>>,

    /// How long a finished record stays readable.
    retention: Duration,
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// Registers a new operation.
    pub fn create(&self, operation_id: &str, total_steps: u64) -> ServerResult<()> {
        if total_steps == 0 {
            return Err(ServerError::validation("total_steps must be at least 1"));
        }

        match self.entries.entry(operation_id.to_string()) {
            Entry::Occupied(_) => {
                Err(ErrorKind::DuplicateOperation(operation_id.to_string()).into())
            }
            Entry::Vacant(vacant) => {
                let record = ProgressRecord::new(operation_id.to_string(), total_steps);
                vacant.insert(Arc::new(ProgressEntry::new(record)));

                tracing::debug!(
                    "Tracking operation {} over {} steps",
                    operation_id,
                    total_steps
                );

                Ok(())
            }
        }
    }

    /// Reports the current step of an operation.
    ///
    /// The step is clamped to `0..=total_steps` and never moves backwards.
    /// A regressing step still records the message and metadata. Updates
    /// after the operation finished are ignored.
    pub fn update(
        &self,
        operation_id: &str,
        current_step: u64,
        message: &str,
        metadata: Option<Map<String, Value>>,
    ) -> ServerResult<()> {
        let entry = self.get(operation_id)?;

        let published = entry.publish(|current| {
            if current.is_terminal() {
                return None;
            }

            let mut next = current.clone();
            next.current_step = current.current_step.max(current_step.min(next.total_steps));
            next.percentage = percentage(next.current_step, next.total_steps);
            next.message = message.to_string();
            if let Some(metadata) = &metadata {
                next.metadata = metadata.clone();
            }

            Some(next)
        });

        if !published {
            tracing::warn!(
                "Ignoring progress update for finished operation {}",
                operation_id
            );
        }

        Ok(())
    }

    /// Marks an operation as successfully completed.
    ///
    /// Completing a finished operation is a no-op.
    pub fn complete(
        &self,
        operation_id: &str,
        final_metadata: Option<Map<String, Value>>,
    ) -> ServerResult<()> {
        let entry = self.get(operation_id)?;

        let published = entry.publish(|current| {
            if current.is_terminal() {
                return None;
            }

            let mut next = current.clone();
            next.current_step = next.total_steps;
            next.percentage = 100.0;
            next.message = "Completed".to_string();
            if let Some(metadata) = &final_metadata {
                next.metadata.extend(metadata.clone());
            }
            next.completed = true;
            next.finish();

            Some(next)
        });

        if published {
            tracing::info!("Operation {} completed", operation_id);
        }

        Ok(())
    }

    /// Marks an operation as failed.
    ///
    /// Failing a finished operation is a no-op.
    pub fn fail(&self, operation_id: &str, error_message: &str) -> ServerResult<()> {
        let entry = self.get(operation_id)?;

        let published = entry.publish(|current| {
            if current.is_terminal() {
                return None;
            }

            let mut next = current.clone();
            next.message = "Failed".to_string();
            next.failed = true;
            next.error = Some(error_message.to_string());
            next.finish();

            Some(next)
        });

        if published {
            tracing::info!("Operation {} failed: {}", operation_id, error_message);
        }

        Ok(())
    }

    /// Requests cancellation of an operation.
    ///
    /// The record is failed right away. The processor notices the request
    /// on its next progress report and stops. Returns whether the request
    /// changed anything.
    pub fn cancel(&self, operation_id: &str) -> ServerResult<bool> {
        let entry = self.get(operation_id)?;
        entry.cancel_requested.store(true, Ordering::Release);

        let published = entry.publish(|current| {
            if current.is_terminal() {
                return None;
            }

            let mut next = current.clone();
            next.message = "Cancelled".to_string();
            next.failed = true;
            next.cancelled = true;
            next.error = Some(CANCELLED_MESSAGE.to_string());
            next.finish();

            Some(next)
        });

        if published {
            tracing::info!("Operation {} cancelled", operation_id);
        }

        Ok(published)
    }

    /// Returns whether cancellation of an operation was requested.
    pub fn is_cancelled(&self, operation_id: &str) -> bool {
        self.entries
            .get(operation_id)
            .map(|entry| entry.cancel_requested.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Returns a snapshot of an operation's progress.
    pub fn read(&self, operation_id: &str) -> ServerResult<Arc<ProgressRecord>> {
        Ok(self.get(operation_id)?.snapshot())
    }

    /// Subscribes to the progress of an operation.
    ///
    /// The receiver sees every published snapshot, starting with the
    /// current one.
    pub fn subscribe(&self, operation_id: &str) -> ServerResult<watch::Receiver<Arc<ProgressRecord>>> {
        Ok(self.get(operation_id)?.notify.subscribe())
    }

    /// Drops finished records older than the retention window.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    /// Drops records that finished at least one retention window before `now`.
    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            let record = entry.snapshot();
            match record.finished_at {
                Some(finished_at) => match (now - finished_at).to_std() {
                    Ok(age) => age < self.retention,
                    Err(_) => true,
                },
                None => true,
            }
        });

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!("Evicted {} finished operations", evicted);
        }

        evicted
    }

    fn get(&self, operation_id: &str) -> ServerResult<Arc<ProgressEntry>> {
        self.entries
            .get(operation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServerError::not_found(format!("Operation {}", operation_id)))
    }
}

/// Handle a processor uses to report its progress.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    operation_id: String,
    total_steps: u64,
}

impl ProgressReporter {
    pub fn new(tracker: Arc<ProgressTracker>, operation_id: String, total_steps: u64) -> Self {
        Self {
            tracker,
            operation_id,
            total_steps,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Reports progress.
    ///
    /// Fails once cancellation was requested, so that a processor can bail
    /// out with `?`.
    pub fn update(&self, step: u64, message: &str) -> Result<()> {
        self.update_with(step, message, None)
    }

    /// Reports progress together with metadata.
    pub fn update_with(
        &self,
        step: u64,
        message: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Err(anyhow!("Operation was cancelled"));
        }

        self.tracker
            .update(&self.operation_id, step, message, metadata)
            .map_err(|e| anyhow!("{}", e))
    }

    pub fn is_cancelled(&self) -> bool {
        self.tracker.is_cancelled(&self.operation_id)
    }
}

/// Returns `done / total` as a percentage with two decimals.
pub fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }

    let ratio = (done as f64 / total as f64).clamp(0.0, 1.0);
    (ratio * 10_000.0).round() / 100.0
}
