//! In-process source and destination.
//!
//! [`MemoryDestination`] backs the `--dry-run` mode of the CLI. Both types are
//! also the collaborators the engine's scenario tests run against, so they can
//! inject the failures a real warehouse produces: rejected batches, tables that
//! never become visible, and flaky existence probes.

use crate::destination::{Destination, InsertError};
use crate::error::{Error, Result};
use crate::reconcile::Clock;
use crate::row::{Row, Value};
use crate::sanitize::{format_timestamp, SanitizedRow};
use crate::schema::DestinationSchema;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A recorded query against a [`MemorySource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceQuery {
    /// `current_timestamp()`
    CurrentTimestamp,
    /// `has_column(table, column)`
    HasColumn(String, String),
    /// `fetch_all(table)`
    FetchAll(String),
    /// `fetch_since(table, column, checkpoint)`
    FetchSince(String, String, String),
}

#[derive(Debug, Default)]
struct SourceTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct SourceState {
    tables: HashMap<String, SourceTable>,
    clock: VecDeque<String>,
    failing: HashSet<String>,
    failing_column_lookups: HashSet<String>,
    clock_fails: bool,
    inserted_after_capture: HashMap<String, Vec<Row>>,
    queries: Vec<SourceQuery>,
}

/// An in-memory relational source.
///
/// Rows carry their own timestamps; `fetch_since` compares the tracked column
/// as instants, like the server-side cast does.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table with its declared columns.
    pub async fn add_table(&self, table: &str, columns: &[&str]) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            table.to_string(),
            SourceTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Append a row to a table, creating the table from the row's keys if
    /// needed.
    pub async fn push_row(&self, table: &str, row: Row) {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| SourceTable {
                columns: row.keys().map(str::to_string).collect(),
                rows: Vec::new(),
            });
        entry.rows.push(row);
    }

    /// Queue the values returned by successive `current_timestamp` calls.
    ///
    /// Once the queue is empty the local clock is used.
    pub async fn queue_timestamps<I, T>(&self, timestamps: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut state = self.state.lock().await;
        state.clock.extend(timestamps.into_iter().map(Into::into));
    }

    /// Make every query against `table` fail.
    pub async fn fail_table(&self, table: &str) {
        self.state.lock().await.failing.insert(table.to_string());
    }

    /// Make `has_column` fail for `table` while fetches keep working.
    pub async fn fail_column_lookup(&self, table: &str) {
        self.state
            .lock()
            .await
            .failing_column_lookups
            .insert(table.to_string());
    }

    /// Make every `current_timestamp` call fail.
    pub async fn fail_clock(&self) {
        self.state.lock().await.clock_fails = true;
    }

    /// Insert `row` into `table` after the next checkpoint capture and before
    /// the extraction query that follows it.
    pub async fn insert_after_capture(&self, table: &str, row: Row) {
        let mut state = self.state.lock().await;
        state
            .inserted_after_capture
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Queries received so far, in order.
    pub async fn queries(&self) -> Vec<SourceQuery> {
        self.state.lock().await.queries.clone()
    }

    fn check_failing(state: &SourceState, table: &str) -> Result<()> {
        if state.failing.contains(table) {
            return Err(Error::source_error(table, "Injected source failure"));
        }
        Ok(())
    }

    fn apply_pending_inserts(state: &mut SourceState, table: &str) {
        if let Some(rows) = state.inserted_after_capture.remove(table) {
            if let Some(t) = state.tables.get_mut(table) {
                t.rows.extend(rows);
            }
        }
    }
}

impl crate::source::Source for MemorySource {
    async fn current_timestamp(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        state.queries.push(SourceQuery::CurrentTimestamp);
        if state.clock_fails {
            return Err(Error::source_error("", "Injected clock failure"));
        }
        Ok(state
            .clock
            .pop_front()
            .unwrap_or_else(|| format_timestamp(&Utc::now())))
    }

    async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state
            .queries
            .push(SourceQuery::HasColumn(table.to_string(), column.to_string()));
        Self::check_failing(&state, table)?;
        if state.failing_column_lookups.contains(table) {
            return Err(Error::source_error(table, "Injected column lookup failure"));
        }
        Ok(state
            .tables
            .get(table)
            .is_some_and(|t| t.columns.iter().any(|c| c == column)))
    }

    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>> {
        let mut state = self.state.lock().await;
        state.queries.push(SourceQuery::FetchAll(table.to_string()));
        Self::check_failing(&state, table)?;
        Self::apply_pending_inserts(&mut state, table);

        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| Error::source_error(table, "relation does not exist"))
    }

    async fn fetch_since(&self, table: &str, column: &str, checkpoint: &str) -> Result<Vec<Row>> {
        let mut state = self.state.lock().await;
        state.queries.push(SourceQuery::FetchSince(
            table.to_string(),
            column.to_string(),
            checkpoint.to_string(),
        ));
        Self::check_failing(&state, table)?;
        Self::apply_pending_inserts(&mut state, table);

        let since = parse_instant(checkpoint).ok_or_else(|| {
            Error::source_error(table, format!("invalid timestamp '{}'", checkpoint))
        })?;
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| Error::source_error(table, "relation does not exist"))?;

        let mut rows: Vec<(DateTime<Utc>, Row)> = t
            .rows
            .iter()
            .filter_map(|row| {
                let at = row.get(column).and_then(value_instant)?;
                (at > since).then(|| (at, row.clone()))
            })
            .collect();
        rows.sort_by_key(|(at, _)| *at);

        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn value_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(t) => Some(*t),
        Value::Text(s) => parse_instant(s),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct DestinationTable {
    schema: Option<DestinationSchema>,
    columns: Vec<String>,
    rows: Vec<SanitizedRow>,
    insert_calls: usize,
}

#[derive(Debug, Default)]
struct DestinationState {
    tables: HashMap<String, DestinationTable>,
    failing_batches: HashMap<String, HashSet<usize>>,
    hidden: HashSet<String>,
    invisible_probes: HashMap<String, u32>,
    probe_errors: HashMap<String, u32>,
    exists_calls: HashMap<String, u32>,
}

/// An in-memory warehouse.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
}

impl MemoryDestination {
    /// Create an empty destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create a table with the given columns.
    pub async fn create_existing(&self, table: &str, columns: &[&str]) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            table.to_string(),
            DestinationTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            },
        );
    }

    /// Reject the insert call with zero-based index `batch` for `table`.
    pub async fn fail_batch(&self, table: &str, batch: usize) {
        let mut state = self.state.lock().await;
        state
            .failing_batches
            .entry(table.to_string())
            .or_default()
            .insert(batch);
    }

    /// Never report `table` as existing.
    pub async fn hide_table(&self, table: &str) {
        self.state.lock().await.hidden.insert(table.to_string());
    }

    /// Report a created `table` as missing for its next `probes` existence
    /// checks.
    pub async fn delay_visibility(&self, table: &str, probes: u32) {
        let mut state = self.state.lock().await;
        state.invisible_probes.insert(table.to_string(), probes);
    }

    /// Fail the next `probes` existence checks on `table` once it exists.
    pub async fn fail_probes(&self, table: &str, probes: u32) {
        let mut state = self.state.lock().await;
        state.probe_errors.insert(table.to_string(), probes);
    }

    /// Rows stored in `table`.
    pub async fn rows(&self, table: &str) -> Vec<SanitizedRow> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Columns of `table`, if it was created.
    pub async fn columns(&self, table: &str) -> Option<Vec<String>> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.columns.clone())
    }

    /// Schema `table` was created with by the engine.
    pub async fn created_schema(&self, table: &str) -> Option<DestinationSchema> {
        let state = self.state.lock().await;
        state.tables.get(table).and_then(|t| t.schema.clone())
    }

    /// Number of insert calls made for `table`.
    pub async fn insert_calls(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map_or(0, |t| t.insert_calls)
    }

    /// Number of existence checks made for `table`.
    pub async fn exists_calls(&self, table: &str) -> u32 {
        let state = self.state.lock().await;
        state.exists_calls.get(table).copied().unwrap_or(0)
    }
}

impl Destination for MemoryDestination {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        *state.exists_calls.entry(table.to_string()).or_default() += 1;

        if state.hidden.contains(table) || !state.tables.contains_key(table) {
            return Ok(false);
        }

        if let Some(remaining) = state.probe_errors.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::destination_error(table, "Injected probe failure"));
            }
        }

        if let Some(remaining) = state.invisible_probes.get_mut(table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn create_table(&self, schema: &DestinationSchema) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(schema.table.clone())
            .or_insert_with(|| DestinationTable {
                schema: Some(schema.clone()),
                columns: schema.column_names(),
                ..Default::default()
            });
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[SanitizedRow],
    ) -> std::result::Result<(), InsertError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(t) = state.tables.get_mut(table) else {
            return Err(InsertError::new(format!("Table '{}' does not exist", table)));
        };
        let call = t.insert_calls;
        t.insert_calls += 1;
        let fail = state
            .failing_batches
            .get(table)
            .is_some_and(|batches| batches.contains(&call));

        if fail {
            return Err(InsertError::new(format!("Injected failure for batch {}", call))
                .with_row_error(0, "rejected by destination"));
        }

        let projected: Vec<SanitizedRow> = rows.iter().map(|r| r.project(&t.columns)).collect();
        t.rows.extend(projected);
        Ok(())
    }
}

/// A clock that records requested sleeps and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct InstantClock {
    sleeps: Arc<std::sync::Mutex<Vec<Duration>>>,
}

impl InstantClock {
    /// Create a clock with no recorded sleeps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Clock for InstantClock {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
    }
}
