//! Source collaborator interface.

use crate::error::Result;
use crate::row::Row;
use std::future::Future;

/// A relational source the engine extracts rows from.
pub trait Source {
    /// Current time on the source's clock, as an ISO-8601 string.
    fn current_timestamp(&self) -> impl Future<Output = Result<String>> + Send;

    /// Whether `table` has a column named `column`.
    fn has_column(&self, table: &str, column: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Every row of `table`.
    fn fetch_all(&self, table: &str) -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// Rows of `table` whose `column` is strictly greater than `checkpoint`,
    /// ascending by `column`.
    fn fetch_since(
        &self,
        table: &str,
        column: &str,
        checkpoint: &str,
    ) -> impl Future<Output = Result<Vec<Row>>> + Send;
}
