//! Batched loading with per-batch failure isolation.

use crate::destination::{Destination, InsertError};
use crate::row::Row;
use crate::sanitize::{sanitize_row, SanitizedRow};
use serde::Serialize;
use tracing::{debug, error, instrument};

/// Default number of rows per insert call.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Row-level errors logged per failed batch.
const LOGGED_ROW_ERRORS: usize = 3;

/// Outcome of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Zero-based batch index
    pub index: usize,
    /// Rows in the batch
    pub rows: usize,
    /// Insert error, if the destination rejected the batch
    #[serde(serialize_with = "serialize_insert_error")]
    pub error: Option<InsertError>,
}

impl BatchOutcome {
    /// Whether the batch was accepted.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn serialize_insert_error<S>(
    error: &Option<InsertError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Per-batch outcomes of one load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Outcomes in batch order
    pub batches: Vec<BatchOutcome>,
}

impl LoadReport {
    /// Rows in accepted batches.
    pub fn rows_loaded(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.is_success())
            .map(|b| b.rows)
            .sum()
    }

    /// Rows in rejected batches.
    pub fn rows_failed(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| !b.is_success())
            .map(|b| b.rows)
            .sum()
    }

    /// Number of rejected batches.
    pub fn failed_batches(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_success()).count()
    }
}

/// Loads rows into a destination table in fixed-size batches.
///
/// A rejected batch is logged and skipped; its rows are not retried.
pub struct BatchLoader<'a, D> {
    destination: &'a D,
    batch_size: usize,
}

impl<'a, D: Destination> BatchLoader<'a, D> {
    /// Create a loader. A zero batch size is treated as one.
    pub fn new(destination: &'a D, batch_size: usize) -> Self {
        Self {
            destination,
            batch_size: batch_size.max(1),
        }
    }

    /// Batch size in use.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load `rows` into `table` in input order.
    #[instrument(skip(self, rows), fields(rows = rows.len(), batch_size = self.batch_size))]
    pub async fn load(&self, table: &str, rows: &[Row]) -> LoadReport {
        let mut report = LoadReport::default();

        for (index, chunk) in rows.chunks(self.batch_size).enumerate() {
            let batch: Vec<SanitizedRow> = chunk.iter().map(sanitize_row).collect();

            let error = match self.destination.insert_rows(table, &batch).await {
                Ok(()) => {
                    debug!(
                        "Inserted batch {} ({} rows) into {}",
                        index + 1,
                        batch.len(),
                        table
                    );
                    None
                }
                Err(e) => {
                    log_batch_failure(table, index, batch.len(), &e);
                    Some(e)
                }
            };

            report.batches.push(BatchOutcome {
                index,
                rows: batch.len(),
                error,
            });
        }

        report
    }
}

fn log_batch_failure(table: &str, index: usize, rows: usize, err: &InsertError) {
    error!(
        table = %table,
        batch = index + 1,
        rows = rows,
        "Batch {} of {} failed ({} rows): {}",
        index + 1,
        table,
        rows,
        err.message
    );
    for row_error in err.row_errors.iter().take(LOGGED_ROW_ERRORS) {
        error!(table = %table, batch = index + 1, "  {}", row_error);
    }
}
