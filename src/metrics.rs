//! Metrics and observability for pg-warehouse-sync.
//!
//! Counters are kept locally for `--json` summaries and mirrored to the
//! `metrics` facade so an installed recorder can export them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for sync runs.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tables whose extraction succeeded
    pub tables_synced: AtomicU64,
    /// Tables that failed extraction or reconciliation
    pub tables_failed: AtomicU64,
    /// Rows read from the source
    pub rows_extracted: AtomicU64,
    /// Rows accepted by the destination
    pub rows_loaded: AtomicU64,
    /// Rows in rejected batches
    pub rows_failed: AtomicU64,
    /// Batches accepted
    pub batches_loaded: AtomicU64,
    /// Batches rejected
    pub batches_failed: AtomicU64,
    /// Checkpoints advanced
    pub checkpoints_advanced: AtomicU64,
    /// Total table processing time in milliseconds
    pub sync_duration_ms: AtomicU64,
}

/// Counts from one table pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Whether the table pass succeeded
    pub success: bool,
    /// Rows extracted
    pub rows_extracted: u64,
    /// Rows loaded
    pub rows_loaded: u64,
    /// Rows dropped with their batch
    pub rows_failed: u64,
    /// Batches loaded
    pub batches_loaded: u64,
    /// Batches rejected
    pub batches_failed: u64,
    /// Whether the checkpoint moved
    pub checkpoint_advanced: bool,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl Metrics {
    /// Create new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one table pass.
    pub fn record_table(&self, table: &str, counts: TableCounts) {
        let label = table.to_string();

        if counts.success {
            self.tables_synced.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync_tables_total", "table" => label.clone(), "status" => "success")
                .increment(1);
        } else {
            self.tables_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("sync_tables_total", "table" => label.clone(), "status" => "failed")
                .increment(1);
        }

        self.rows_extracted
            .fetch_add(counts.rows_extracted, Ordering::Relaxed);
        self.rows_loaded.fetch_add(counts.rows_loaded, Ordering::Relaxed);
        self.rows_failed.fetch_add(counts.rows_failed, Ordering::Relaxed);
        self.batches_loaded
            .fetch_add(counts.batches_loaded, Ordering::Relaxed);
        self.batches_failed
            .fetch_add(counts.batches_failed, Ordering::Relaxed);
        self.sync_duration_ms
            .fetch_add(counts.duration_ms, Ordering::Relaxed);
        if counts.checkpoint_advanced {
            self.checkpoints_advanced.fetch_add(1, Ordering::Relaxed);
        }

        metrics::counter!("sync_rows_extracted_total", "table" => label.clone())
            .increment(counts.rows_extracted);
        metrics::counter!("sync_rows_loaded_total", "table" => label.clone())
            .increment(counts.rows_loaded);
        metrics::counter!("sync_rows_failed_total", "table" => label.clone())
            .increment(counts.rows_failed);
        metrics::counter!("sync_batches_failed_total", "table" => label)
            .increment(counts.batches_failed);
    }

    /// Get snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tables_synced: self.tables_synced.load(Ordering::Relaxed),
            tables_failed: self.tables_failed.load(Ordering::Relaxed),
            rows_extracted: self.rows_extracted.load(Ordering::Relaxed),
            rows_loaded: self.rows_loaded.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            batches_loaded: self.batches_loaded.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            checkpoints_advanced: self.checkpoints_advanced.load(Ordering::Relaxed),
            sync_duration_ms: self.sync_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.tables_synced,
            &self.tables_failed,
            &self.rows_extracted,
            &self.rows_loaded,
            &self.rows_failed,
            &self.batches_loaded,
            &self.batches_failed,
            &self.checkpoints_advanced,
            &self.sync_duration_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Tables whose extraction succeeded
    pub tables_synced: u64,
    /// Tables that failed
    pub tables_failed: u64,
    /// Rows read from the source
    pub rows_extracted: u64,
    /// Rows accepted by the destination
    pub rows_loaded: u64,
    /// Rows in rejected batches
    pub rows_failed: u64,
    /// Batches accepted
    pub batches_loaded: u64,
    /// Batches rejected
    pub batches_failed: u64,
    /// Checkpoints advanced
    pub checkpoints_advanced: u64,
    /// Total table processing time in milliseconds
    pub sync_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Share of extracted rows that reached the destination.
    pub fn load_rate(&self) -> f64 {
        if self.rows_extracted == 0 {
            1.0
        } else {
            self.rows_loaded as f64 / self.rows_extracted as f64
        }
    }

    /// Calculate rows loaded per second.
    pub fn rows_per_second(&self) -> f64 {
        if self.sync_duration_ms == 0 {
            0.0
        } else {
            (self.rows_loaded as f64 * 1000.0) / self.sync_duration_ms as f64
        }
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    label: String,
}

impl Timer {
    /// Start a new timer.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            label: label.into(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop timer and log duration.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!("{} completed in {}ms", self.label, elapsed);
        elapsed
    }
}
