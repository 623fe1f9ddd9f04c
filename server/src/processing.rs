//! Report processing.
//!
//! Processing runs on the blocking pool, off the request path. Its outcome
//! is only ever visible through the progress record and the result store.
//! The submitting caller never sees a processor failure.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::chunked_session::AssembledFile;
use crate::error::ServerResult;
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::results::{ResultRow, ResultSet, ResultStore, RowKey};
use arrears::report::ReportKind;

/// Column holding the 1-based position of a row in the uploaded file.
pub const ROW_ID_COLUMN: &str = "row_id";

/// Output of a processor, before it is frozen into a result set.
#[derive(Debug)]
pub struct ProcessedReport {
    /// Column rows are grouped by.
    pub sort_key: String,

    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

/// Turns an uploaded file into report rows.
pub trait Processor: Send + Sync + 'static {
    /// Returns the number of progress steps processing `file` takes.
    fn total_steps(&self, file: &AssembledFile) -> u64;

    /// Processes a file, reporting progress as it goes.
    fn process(&self, file: &AssembledFile, reporter: &ProgressReporter) -> Result<ProcessedReport>;
}

/// Processes a CSV export into one row per record.
///
/// Numeric cells become JSON numbers and rows are grouped by the first of
/// the report's grouping columns that the file has.
#[derive(Debug, Clone, Copy)]
pub struct TabularProcessor {
    report: ReportKind,
}

impl TabularProcessor {
    pub fn new(report: ReportKind) -> Self {
        Self { report }
    }
}

impl Processor for TabularProcessor {
    fn total_steps(&self, file: &AssembledFile) -> u64 {
        // One step per line after the header.
        let lines = file.data.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
        (lines.saturating_sub(1) as u64).max(1)
    }

    fn process(&self, file: &AssembledFile, reporter: &ProgressReporter) -> Result<ProcessedReport> {
        reporter.update(0, "Reading file...")?;

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file.data.as_ref());

        let headers: Vec<String> = reader
            .headers()
            .context("Failed to read the header row")?
            .iter()
            .map(String::from)
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(anyhow!("{} has no header row", file.filename));
        }

        let sort_key = self
            .report
            .grouping_columns()
            .iter()
            .find(|column| headers.iter().any(|h| h == *column))
            .map(|column| column.to_string())
            .unwrap_or_else(|| ROW_ID_COLUMN.to_string());
        let group_index = headers.iter().position(|h| *h == sort_key);

        let total = reporter.total_steps();
        let stride = (total / 100).max(1);
        let mut rows = Vec::new();

        for (index, record) in reader.records().enumerate() {
            let id = index as u64 + 1;
            let record = record.with_context(|| format!("Failed to parse row {}", id))?;

            let mut fields = Map::new();
            fields.insert(ROW_ID_COLUMN.to_string(), json!(id));
            for (header, cell) in headers.iter().zip(record.iter()) {
                fields.insert(header.clone(), cell_value(cell));
            }

            let group = group_index
                .and_then(|i| record.get(i))
                .unwrap_or_default()
                .to_string();

            rows.push(ResultRow {
                key: RowKey { group, id },
                fields,
            });

            if id % stride == 0 {
                reporter.update(id, &format!("Processed {} of {} rows", id, total))?;
            }
        }

        reporter.update(total, "Finalizing...")?;

        let mut columns = Vec::with_capacity(headers.len() + 1);
        columns.push(ROW_ID_COLUMN.to_string());
        columns.extend(headers);

        Ok(ProcessedReport {
            sort_key,
            columns,
            rows,
        })
    }
}

/// Converts a CSV cell into a JSON value.
fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }

    if let Ok(n) = cell.parse::<i64>() {
        return json!(n);
    }

    match cell.parse::<f64>() {
        Ok(n) if n.is_finite() => json!(n),
        _ => Value::String(cell.to_string()),
    }
}

/// Returns the processor of a report.
pub fn processor_for(report: ReportKind) -> Arc<dyn Processor> {
    Arc::new(TabularProcessor::new(report))
}

/// Runs processors and records their outcome.
#[derive(Debug, Clone)]
pub struct ProcessingCoordinator {
    tracker: Arc<ProgressTracker>,
    results: Arc<ResultStore>,
}

impl ProcessingCoordinator {
    pub fn new(tracker: Arc<ProgressTracker>, results: Arc<ResultStore>) -> Self {
        Self { tracker, results }
    }

    /// Launches processing of an assembled file.
    ///
    /// The progress record exists when this returns.
    pub fn submit(
        &self,
        file: AssembledFile,
        report: ReportKind,
        operation_id: &str,
    ) -> ServerResult<JoinHandle<()>> {
        self.submit_with(file, report, processor_for(report), operation_id)
    }

    /// Launches processing with a specific processor.
    pub fn submit_with(
        &self,
        file: AssembledFile,
        report: ReportKind,
        processor: Arc<dyn Processor>,
        operation_id: &str,
    ) -> ServerResult<JoinHandle<()>> {
        let total_steps = processor.total_steps(&file).max(1);
        self.tracker.create(operation_id, total_steps)?;

        tracing::info!(
            "Processing {} as {} (operation {}, {} steps)",
            file.filename,
            report,
            operation_id,
            total_steps
        );

        let reporter =
            ProgressReporter::new(self.tracker.clone(), operation_id.to_string(), total_steps);
        let tracker = self.tracker.clone();
        let results = self.results.clone();
        let operation_id = operation_id.to_string();

        let handle = tokio::spawn(async move {
            let job = {
                let operation_id = operation_id.clone();
                tokio::task::spawn_blocking(move || -> Result<ResultSet> {
                    let processed = processor.process(&file, &reporter)?;

                    Ok(ResultSet::new(
                        operation_id,
                        report,
                        processed.sort_key,
                        processed.columns,
                        processed.rows,
                    ))
                })
            };

            let outcome = match job.await {
                Ok(Ok(result)) => {
                    if tracker.is_cancelled(&operation_id) {
                        tracing::info!(
                            "Discarding result of cancelled operation {}",
                            operation_id
                        );
                        return;
                    }

                    let mut metadata = Map::new();
                    metadata.insert("row_count".to_string(), json!(result.len()));
                    metadata.insert("fingerprint".to_string(), json!(result.fingerprint));

                    results.insert(Arc::new(result));
                    tracker.complete(&operation_id, Some(metadata))
                }
                Ok(Err(e)) => tracker.fail(&operation_id, &format!("{:#}", e)),
                Err(e) if e.is_panic() => {
                    tracing::error!("Processor of operation {} panicked", operation_id);
                    tracker.fail(&operation_id, "processor panicked")
                }
                Err(_) => tracker.fail(&operation_id, "processing was aborted"),
            };

            if let Err(e) = outcome {
                tracing::warn!(
                    "Could not record the outcome of operation {}: {}",
                    operation_id,
                    e
                );
            }
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::progress::CANCELLED_MESSAGE;
    use arrears::hash::Hash;

    const PORTFOLIO: &str = "\
LoanID,FieldOfficer,Arrears,Balance
L-1,Mensah,120.50,1000
L-2,Adjei,0,2500
L-3,Mensah,75,
L-4,Boateng,12,400
";

    fn file(data: &'static str) -> AssembledFile {
        AssembledFile {
            session_id: "session".to_string(),
            filename: "portfolio.csv".to_string(),
            data: Bytes::from_static(data.as_bytes()),
            sha256: Hash::sha256_from_bytes(data.as_bytes()),
        }
    }

    fn coordinator() -> (ProcessingCoordinator, Arc<ProgressTracker>, Arc<ResultStore>) {
        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(600)));
        let results = Arc::new(ResultStore::new(Duration::from_secs(3600)));
        (
            ProcessingCoordinator::new(tracker.clone(), results.clone()),
            tracker,
            results,
        )
    }

    struct FailingProcessor;

    impl Processor for FailingProcessor {
        fn total_steps(&self, _file: &AssembledFile) -> u64 {
            10
        }

        fn process(&self, _file: &AssembledFile, reporter: &ProgressReporter) -> Result<ProcessedReport> {
            reporter.update(3, "Loading file...")?;
            Err(anyhow!("column Arrears is missing")).context("Failed to prepare data")
        }
    }

    struct PanickingProcessor;

    impl Processor for PanickingProcessor {
        fn total_steps(&self, _file: &AssembledFile) -> u64 {
            10
        }

        fn process(&self, _file: &AssembledFile, _reporter: &ProgressReporter) -> Result<ProcessedReport> {
            panic!("index out of bounds");
        }
    }

    /// Waits for a signal, then finishes regardless of cancellation.
    struct GatedProcessor {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Processor for GatedProcessor {
        fn total_steps(&self, _file: &AssembledFile) -> u64 {
            10
        }

        fn process(&self, _file: &AssembledFile, _reporter: &ProgressReporter) -> Result<ProcessedReport> {
            self.gate
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10))?;

            Ok(ProcessedReport {
                sort_key: ROW_ID_COLUMN.to_string(),
                columns: vec![ROW_ID_COLUMN.to_string()],
                rows: Vec::new(),
            })
        }
    }

    #[test]
    fn test_cell_values() {
        assert_eq!(cell_value(""), Value::Null);
        assert_eq!(cell_value("42"), json!(42));
        assert_eq!(cell_value("-1.5"), json!(-1.5));
        assert_eq!(cell_value("NaN"), json!("NaN"));
        assert_eq!(cell_value("Mensah"), json!("Mensah"));
    }

    #[test]
    fn test_total_steps_counts_rows() {
        let processor = TabularProcessor::new(ReportKind::ArrangeDues);
        assert_eq!(processor.total_steps(&file(PORTFOLIO)), 4);
        assert_eq!(processor.total_steps(&file("LoanID\n")), 1);
    }

    #[tokio::test]
    async fn test_successful_processing() {
        let (coordinator, tracker, results) = coordinator();

        let handle = coordinator
            .submit(file(PORTFOLIO), ReportKind::ArrangeDues, "op")
            .unwrap();

        // The record exists before processing finishes.
        tracker.read("op").unwrap();
        handle.await.unwrap();

        let record = tracker.read("op").unwrap();
        assert!(record.completed);
        assert_eq!(record.percentage, 100.0);
        assert_eq!(record.metadata["row_count"], 4);

        let result = results.get("op").unwrap();
        assert_eq!(record.metadata["fingerprint"], json!(result.fingerprint));
        assert_eq!(result.sort_key, "FieldOfficer");
        assert_eq!(
            result.columns,
            vec!["row_id", "LoanID", "FieldOfficer", "Arrears", "Balance"]
        );

        let order: Vec<_> = result
            .rows()
            .iter()
            .map(|row| row.fields["LoanID"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["L-2", "L-4", "L-1", "L-3"]);

        let summary = result.summary();
        assert_eq!(summary["total_rows"], 4);
        assert_eq!(summary["totals"]["Arrears"], 207.5);
        assert_eq!(summary["totals"]["Balance"], 3900.0);
    }

    #[tokio::test]
    async fn test_falls_back_to_row_order() {
        let (coordinator, _, results) = coordinator();

        coordinator
            .submit(file("Branch,Total\nAccra,3\nKumasi,4\n"), ReportKind::ArrangeDues, "op")
            .unwrap()
            .await
            .unwrap();

        let result = results.get("op").unwrap();
        assert_eq!(result.sort_key, ROW_ID_COLUMN);
        assert_eq!(result.rows()[0].fields["Branch"], "Accra");
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let (coordinator, tracker, results) = coordinator();

        coordinator
            .submit_with(
                file(PORTFOLIO),
                ReportKind::ArrangeDues,
                Arc::new(FailingProcessor),
                "op",
            )
            .unwrap()
            .await
            .unwrap();

        let record = tracker.read("op").unwrap();
        assert!(record.failed);
        assert!(!record.completed);
        assert_eq!(record.current_step, 3);
        assert_eq!(
            record.error.as_deref(),
            Some("Failed to prepare data: column Arrears is missing")
        );
        assert!(results.get("op").is_none());
    }

    #[tokio::test]
    async fn test_panic_is_recorded() {
        let (coordinator, tracker, _) = coordinator();

        coordinator
            .submit_with(
                file(PORTFOLIO),
                ReportKind::ArrangeDues,
                Arc::new(PanickingProcessor),
                "op",
            )
            .unwrap()
            .await
            .unwrap();

        let record = tracker.read("op").unwrap();
        assert!(record.failed);
        assert_eq!(record.error.as_deref(), Some("processor panicked"));
    }

    #[tokio::test]
    async fn test_malformed_csv_fails() {
        let (coordinator, tracker, _) = coordinator();

        coordinator
            .submit(file("a,b\n1,2\n3,4,5\n"), ReportKind::ArrangeDues, "op")
            .unwrap()
            .await
            .unwrap();

        let record = tracker.read("op").unwrap();
        assert!(record.failed);
        assert!(record.error.as_deref().unwrap().contains("row 2"));
    }

    #[tokio::test]
    async fn test_cancelled_result_is_discarded() {
        let (coordinator, tracker, results) = coordinator();
        let (go, gate) = std::sync::mpsc::channel();

        let handle = coordinator
            .submit_with(
                file(PORTFOLIO),
                ReportKind::ArrangeDues,
                Arc::new(GatedProcessor {
                    gate: Mutex::new(gate),
                }),
                "op",
            )
            .unwrap();

        tracker.cancel("op").unwrap();
        go.send(()).unwrap();
        handle.await.unwrap();

        let record = tracker.read("op").unwrap();
        assert!(record.cancelled);
        assert_eq!(record.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(results.get("op").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_operation_is_rejected() {
        let (coordinator, _, _) = coordinator();

        coordinator
            .submit(file(PORTFOLIO), ReportKind::ArrangeDues, "op")
            .unwrap()
            .await
            .unwrap();

        assert!(coordinator
            .submit(file(PORTFOLIO), ReportKind::ArrangeDues, "op")
            .is_err());
    }
}
