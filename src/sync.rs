//! Core sync logic for pg-warehouse-sync.

use crate::checkpoint::{CheckpointStore, SyncState};
use crate::config::SyncConfig;
use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::loader::BatchLoader;
use crate::metrics::{Metrics, TableCounts, Timer};
use crate::reconcile::{Clock, ReadinessPolicy, SchemaReconciler};
use crate::row::Row;
use crate::sanitize::{format_timestamp, sanitize_row};
use crate::source::Source;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

/// Sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Only rows newer than the table's checkpoint
    Incremental,
    /// Every row of the table
    #[default]
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

/// Sync result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Whether every table was extracted and reconciled
    pub success: bool,
    /// Per-table results, in configuration order
    pub tables: Vec<TableSyncResult>,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when sync completed
    pub completed_at: String,
    /// Whether the checkpoint document was written
    pub checkpoint_saved: bool,
}

impl SyncResult {
    /// Get total rows loaded.
    pub fn total_records(&self) -> usize {
        self.tables.iter().map(|t| t.rows_loaded).sum()
    }

    /// Get total rows dropped with failed batches.
    pub fn total_failed(&self) -> usize {
        self.tables.iter().map(|t| t.rows_failed).sum()
    }

    /// Check if all tables synced successfully.
    pub fn all_tables_success(&self) -> bool {
        self.tables.iter().all(|t| t.success)
    }

    /// Tables whose pass failed.
    pub fn failed_tables(&self) -> impl Iterator<Item = &TableSyncResult> {
        self.tables.iter().filter(|t| !t.success)
    }

    /// Result for `table`, if it was processed.
    pub fn table(&self, table: &str) -> Option<&TableSyncResult> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Per-table sync result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSyncResult {
    /// Table name
    pub table: String,
    /// Extraction mode used
    pub mode: SyncMode,
    /// Whether extraction and reconciliation succeeded
    pub success: bool,
    /// Rows extracted from the source
    pub rows_extracted: usize,
    /// Rows accepted by the destination
    pub rows_loaded: usize,
    /// Rows dropped with rejected batches
    pub rows_failed: usize,
    /// Accepted batches
    pub batches_loaded: usize,
    /// Rejected batches
    pub batches_failed: usize,
    /// Whether the destination table was created during this pass
    pub table_created: bool,
    /// Checkpoint held for the table after this pass
    pub checkpoint: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Error message if failed
    pub error: Option<String>,
}

impl TableSyncResult {
    fn new(table: &str, mode: SyncMode) -> Self {
        Self {
            table: table.to_string(),
            mode,
            success: true,
            rows_extracted: 0,
            rows_loaded: 0,
            rows_failed: 0,
            batches_loaded: 0,
            batches_failed: 0,
            table_created: false,
            checkpoint: None,
            duration_ms: 0,
            error: None,
        }
    }

    fn fail(mut self, err: &Error) -> Self {
        self.success = false;
        self.error = Some(err.to_string());
        self
    }
}

/// Sync progress callback.
pub type ProgressCallback = Box<dyn Fn(SyncProgress) + Send + Sync>;

/// Sync progress update.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Current table being synced
    pub table: String,
    /// Current phase
    pub phase: SyncPhase,
    /// Rows processed so far
    pub rows_processed: usize,
    /// Total rows to process (if known)
    pub total_rows: Option<usize>,
    /// Position of the table in the run, starting at 1
    pub table_index: usize,
    /// Number of tables in the run
    pub table_count: usize,
}

/// Sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Capturing the source clock
    Capturing,
    /// Fetching rows from the source
    Fetching,
    /// Ensuring the destination table exists
    Reconciling,
    /// Loading batches
    Loading,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Capturing => write!(f, "capturing"),
            SyncPhase::Fetching => write!(f, "fetching"),
            SyncPhase::Reconciling => write!(f, "reconciling"),
            SyncPhase::Loading => write!(f, "loading"),
            SyncPhase::Completed => write!(f, "completed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Sync engine over a source, a destination, and a clock.
pub struct SyncEngine<S, D, C> {
    config: SyncConfig,
    source: S,
    destination: D,
    clock: C,
    store: CheckpointStore,
    progress_callback: Option<Arc<ProgressCallback>>,
    metrics: Arc<Metrics>,
    dry_run: bool,
}

impl<S: Source, D: Destination, C: Clock> SyncEngine<S, D, C> {
    /// Create a new sync engine.
    pub fn new(config: SyncConfig, source: S, destination: D, clock: C) -> Self {
        let store = CheckpointStore::new(&config.sync.state_file);
        Self {
            config,
            source,
            destination,
            clock,
            store,
            progress_callback: None,
            metrics: Arc::new(Metrics::new()),
            dry_run: false,
        }
    }

    /// Set progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(SyncProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(Box::new(callback)));
        self
    }

    /// Run without writing the checkpoint document.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Source collaborator.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Destination collaborator.
    pub fn destination(&self) -> &D {
        &self.destination
    }

    /// Checkpoint store used by [`SyncEngine::run`].
    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Metrics accumulated across runs.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one pass: load checkpoints, sync every table, save checkpoints once.
    #[instrument(skip(self), fields(tables = self.config.sync.tables.len(), dry_run = self.dry_run))]
    pub async fn run(&self) -> SyncResult {
        let mut state = if self.dry_run {
            self.store.load_readonly()
        } else {
            self.store.load()
        };
        debug!("Loaded {} checkpoints", state.len());

        let mut result = self.sync_tables(&mut state).await;

        if self.dry_run {
            info!("Dry run: checkpoint document not written");
        } else {
            match self.store.save(&state) {
                Ok(()) => result.checkpoint_saved = true,
                Err(e) => error!("Failed to save checkpoints: {}", e),
            }
        }

        result
    }

    /// Sync every configured table in order, updating `state` in place.
    pub async fn sync_tables(&self, state: &mut SyncState) -> SyncResult {
        let start = Instant::now();
        let tables = &self.config.sync.tables;

        info!("Starting sync of {} tables", tables.len());

        let mut results = Vec::with_capacity(tables.len());
        for (idx, table) in tables.iter().enumerate() {
            let result = self.sync_table(table, state, idx + 1).await;
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = SyncResult {
            success: results.iter().all(|t| t.success),
            tables: results,
            duration_ms,
            completed_at: format_timestamp(&Utc::now()),
            checkpoint_saved: false,
        };

        if result.success {
            info!(
                "Sync completed successfully in {}ms. Rows loaded: {}, Rows dropped: {}, Tables: {}",
                duration_ms,
                result.total_records(),
                result.total_failed(),
                result.tables.len()
            );
        } else {
            warn!(
                "Sync completed with errors in {}ms. Rows loaded: {}, Failed tables: {}",
                duration_ms,
                result.total_records(),
                result.failed_tables().count()
            );
        }

        result
    }

    /// Sync a single table. Errors are captured in the result.
    #[instrument(skip_all, fields(table = %table))]
    async fn sync_table(&self, table: &str, state: &mut SyncState, position: usize) -> TableSyncResult {
        let timer = Timer::start(format!("sync {}", table));
        let sync = &self.config.sync;
        let last = state.get(table).map(str::to_string);

        self.report_progress(table, position, SyncPhase::Capturing, 0, None);

        // Captured before extraction so rows committed during the query are
        // picked up by the next pass.
        let captured = match self.source.current_timestamp().await {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Failed to read source clock for {}, using local clock: {}", table, e);
                format_timestamp(&Utc::now())
            }
        };

        let trackable = match self.source.has_column(table, &sync.tracked_column).await {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    "Could not check column {} on {}, treating table as untracked: {}",
                    sync.tracked_column, table, e
                );
                false
            }
        };

        let mode = match &last {
            Some(_) if trackable && !sync.full_refresh => SyncMode::Incremental,
            _ => SyncMode::Full,
        };

        let mut result = TableSyncResult::new(table, mode);
        let outcome = self
            .extract_and_load(table, mode, last.as_deref(), position, &mut result)
            .await;

        match outcome {
            Ok(()) => {
                if trackable {
                    state.set(table, captured.as_str());
                } else {
                    debug!("{} has no {} column, checkpoint not tracked", table, sync.tracked_column);
                }
                self.report_progress(
                    table,
                    position,
                    SyncPhase::Completed,
                    result.rows_loaded,
                    Some(result.rows_extracted),
                );
            }
            Err(e) => {
                error!(
                    table = %table,
                    rows = result.rows_extracted,
                    "Failed to sync table {}: {}",
                    table,
                    e
                );
                result = result.fail(&e);
                self.report_progress(table, position, SyncPhase::Failed, 0, None);
            }
        }

        result.checkpoint = state.get(table).map(str::to_string);
        result.duration_ms = timer.stop();

        self.metrics.record_table(
            table,
            TableCounts {
                success: result.success,
                rows_extracted: result.rows_extracted as u64,
                rows_loaded: result.rows_loaded as u64,
                rows_failed: result.rows_failed as u64,
                batches_loaded: result.batches_loaded as u64,
                batches_failed: result.batches_failed as u64,
                checkpoint_advanced: result.success && trackable,
                duration_ms: result.duration_ms,
            },
        );

        result
    }

    async fn extract_and_load(
        &self,
        table: &str,
        mode: SyncMode,
        last: Option<&str>,
        position: usize,
        result: &mut TableSyncResult,
    ) -> Result<()> {
        self.report_progress(table, position, SyncPhase::Fetching, 0, None);

        let rows = self.fetch(table, mode, last).await?;
        result.rows_extracted = rows.len();

        if rows.is_empty() {
            info!("No new rows for {}", table);
            return Ok(());
        }

        info!("Fetched {} rows from {} ({})", rows.len(), table, mode);

        self.report_progress(table, position, SyncPhase::Reconciling, 0, Some(rows.len()));

        let policy = ReadinessPolicy::from(&self.config.readiness);
        let reconciler = SchemaReconciler::new(&self.destination, &self.clock, policy);
        let reconciled = reconciler.ensure_table(table, &sanitize_row(&rows[0])).await?;
        result.table_created = reconciled.created();

        self.report_progress(table, position, SyncPhase::Loading, 0, Some(rows.len()));

        let loader = BatchLoader::new(&self.destination, self.config.sync.batch_size);
        let report = loader.load(table, &rows).await;

        result.rows_loaded = report.rows_loaded();
        result.rows_failed = report.rows_failed();
        result.batches_failed = report.failed_batches();
        result.batches_loaded = report.batches.len() - result.batches_failed;

        if result.rows_failed > 0 {
            warn!(
                "Loaded {} of {} rows into {} ({} batches failed)",
                result.rows_loaded, result.rows_extracted, table, result.batches_failed
            );
        } else {
            info!("Loaded {} rows into {}", result.rows_loaded, table);
        }

        Ok(())
    }

    async fn fetch(&self, table: &str, mode: SyncMode, last: Option<&str>) -> Result<Vec<Row>> {
        match (mode, last) {
            (SyncMode::Incremental, Some(since)) => {
                self.source
                    .fetch_since(table, &self.config.sync.tracked_column, since)
                    .await
            }
            _ => self.source.fetch_all(table).await,
        }
    }

    /// Report progress via callback.
    fn report_progress(
        &self,
        table: &str,
        position: usize,
        phase: SyncPhase,
        rows_processed: usize,
        total_rows: Option<usize>,
    ) {
        if let Some(ref callback) = self.progress_callback {
            callback(SyncProgress {
                table: table.to_string(),
                phase,
                rows_processed,
                total_rows,
                table_index: position,
                table_count: self.config.sync.tables.len(),
            });
        }
    }
}
