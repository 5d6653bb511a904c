//! Destination collaborator interface.

use crate::error::Result;
use crate::sanitize::SanitizedRow;
use crate::schema::DestinationSchema;
use std::fmt;
use std::future::Future;

/// A warehouse the engine loads sanitized rows into.
pub trait Destination {
    /// Whether `table` exists and is visible.
    fn table_exists(&self, table: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Create a table. Creation may not be visible to [`Destination::table_exists`]
    /// immediately.
    fn create_table(&self, schema: &DestinationSchema) -> impl Future<Output = Result<()>> + Send;

    /// Insert one batch of rows.
    ///
    /// Keys not present in the table are ignored. On failure the whole batch is
    /// considered rejected.
    fn insert_rows(
        &self,
        table: &str,
        rows: &[SanitizedRow],
    ) -> impl Future<Output = std::result::Result<(), InsertError>> + Send;
}

/// A rejected batch insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertError {
    /// Summary reported by the destination
    pub message: String,
    /// Row-level errors, when the destination reports them
    pub row_errors: Vec<RowError>,
}

impl InsertError {
    /// An insert error without row detail.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            row_errors: Vec::new(),
        }
    }

    /// Attach a row-level error.
    pub fn with_row_error(mut self, row: usize, message: impl Into<String>) -> Self {
        self.row_errors.push(RowError {
            row,
            message: message.into(),
        });
        self
    }
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.row_errors.is_empty() {
            write!(f, " ({} row errors)", self.row_errors.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for InsertError {}

/// Error for a single row of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Zero-based index of the row within its batch
    pub row: usize,
    /// Error reported for the row
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.message)
    }
}
