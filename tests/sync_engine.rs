//! End-to-end sync passes against the in-memory collaborators.

use chrono::{DateTime, Utc};
use pg_warehouse_sync::memory::SourceQuery;
use pg_warehouse_sync::{
    CheckpointStore, Error, InstantClock, MemoryDestination, MemorySource, Row, SyncConfig,
    SyncEngine, SyncMode, SyncPhase, SyncState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const T0: &str = "2024-05-01T10:00:00.000Z";
const T1: &str = "2024-05-01T11:00:00.000Z";
const T2: &str = "2024-05-01T12:00:00.000Z";

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn order(id: i64, created_at: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("total", 10.5)
        .with("created_at", ts(created_at))
}

fn state_path(dir: &TempDir) -> String {
    dir.path().join("sync_state.json").display().to_string()
}

fn config(dir: &TempDir, tables: &[&str]) -> SyncConfig {
    SyncConfig::builder()
        .postgres_url("postgres://localhost/app")
        .motherduck_token("token")
        .tables(tables.iter().copied())
        .state_file(state_path(dir))
        .build()
        .unwrap()
}

fn seed_state(dir: &TempDir, entries: &[(&str, &str)]) {
    let state: SyncState = entries.iter().copied().collect();
    CheckpointStore::new(state_path(dir)).save(&state).unwrap();
}

fn stored_state(dir: &TempDir) -> SyncState {
    CheckpointStore::new(state_path(dir)).load()
}

struct Harness {
    source: MemorySource,
    destination: MemoryDestination,
    clock: InstantClock,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: MemorySource::new(),
            destination: MemoryDestination::new(),
            clock: InstantClock::new(),
        }
    }

    fn engine(&self, config: SyncConfig) -> SyncEngine<MemorySource, MemoryDestination, InstantClock> {
        SyncEngine::new(
            config,
            self.source.clone(),
            self.destination.clone(),
            self.clock.clone(),
        )
    }
}

#[tokio::test]
async fn first_sync_loads_everything_and_sets_checkpoint() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    for (id, at) in [(1, "2024-04-01T00:00:00Z"), (2, "2024-04-02T00:00:00Z"), (3, "2024-04-03T00:00:00Z")] {
        h.source.push_row("orders", order(id, at)).await;
    }
    h.source.queue_timestamps([T0]).await;

    let result = h.engine(config(&dir, &["orders"])).run().await;

    assert!(result.success);
    assert!(result.checkpoint_saved);
    let orders = result.table("orders").unwrap();
    assert_eq!(orders.mode, SyncMode::Full);
    assert_eq!(orders.rows_extracted, 3);
    assert_eq!(orders.rows_loaded, 3);
    assert!(orders.table_created);
    assert_eq!(orders.checkpoint.as_deref(), Some(T0));

    assert_eq!(h.destination.insert_calls("orders").await, 1);
    assert_eq!(
        h.destination.columns("orders").await.unwrap(),
        vec!["id", "total", "created_at"]
    );
    let rows = h.destination.rows("orders").await;
    assert_eq!(rows[0].value("created_at"), Some("2024-04-01T00:00:00.000Z"));
    assert_eq!(rows[0].value("total"), Some("10.5"));

    assert_eq!(stored_state(&dir).get("orders"), Some(T0));
}

#[tokio::test]
async fn incremental_sync_fetches_only_newer_rows_in_order() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("orders", T0)]);

    let h = Harness::new();
    h.destination
        .create_existing("orders", &["id", "total", "created_at"])
        .await;
    h.source.push_row("orders", order(1, "2024-05-01T09:00:00Z")).await;
    h.source.push_row("orders", order(3, "2024-05-01T10:30:00Z")).await;
    h.source.push_row("orders", order(2, "2024-05-01T10:15:00Z")).await;
    h.source.queue_timestamps([T1]).await;

    let result = h.engine(config(&dir, &["orders"])).run().await;

    let orders = result.table("orders").unwrap();
    assert_eq!(orders.mode, SyncMode::Incremental);
    assert_eq!(orders.rows_loaded, 2);
    assert!(!orders.table_created);

    let ids: Vec<_> = h
        .destination
        .rows("orders")
        .await
        .iter()
        .map(|r| r.value("id").map(str::to_string))
        .collect();
    assert_eq!(ids, vec![Some("2".to_string()), Some("3".to_string())]);

    assert!(h.source.queries().await.contains(&SourceQuery::FetchSince(
        "orders".into(),
        "created_at".into(),
        T0.into()
    )));
    assert_eq!(stored_state(&dir).get("orders"), Some(T1));
}

#[tokio::test]
async fn checkpoint_is_captured_before_extraction() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("orders", T0)]);

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-05-01T09:00:00Z")).await;
    // Committed after the clock read of the first pass, before its query
    h.source
        .insert_after_capture("orders", order(2, "2024-05-01T11:00:00.500Z"))
        .await;
    h.source.queue_timestamps([T1, T2]).await;

    let engine = h.engine(config(&dir, &["orders"]));
    let first = engine.run().await;

    let queries = h.source.queries().await;
    let capture = queries
        .iter()
        .position(|q| *q == SourceQuery::CurrentTimestamp)
        .unwrap();
    let fetch = queries
        .iter()
        .position(|q| matches!(q, SourceQuery::FetchSince(..)))
        .unwrap();
    assert!(capture < fetch);
    assert_eq!(first.table("orders").unwrap().checkpoint.as_deref(), Some(T1));

    // The late row is newer than the captured checkpoint, so it is seen again
    let second = engine.run().await;
    let orders = second.table("orders").unwrap();
    assert_eq!(orders.rows_extracted, 1);
    assert_eq!(orders.checkpoint.as_deref(), Some(T2));
}

#[tokio::test]
async fn untracked_table_is_always_fully_extracted() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.add_table("tags", &["id", "name"]).await;
    h.source
        .push_row("tags", Row::new().with("id", 1i64).with("name", "red"))
        .await;

    let engine = h.engine(config(&dir, &["tags"]));
    let first = engine.run().await;
    let second = engine.run().await;

    for result in [&first, &second] {
        let tags = result.table("tags").unwrap();
        assert!(tags.success);
        assert_eq!(tags.mode, SyncMode::Full);
        assert_eq!(tags.checkpoint, None);
    }

    let fetches = h
        .source
        .queries()
        .await
        .into_iter()
        .filter(|q| matches!(q, SourceQuery::FetchAll(t) if t == "tags"))
        .count();
    assert_eq!(fetches, 2);
    assert_eq!(stored_state(&dir).get("tags"), None);
    // No deduplication across passes
    assert_eq!(h.destination.rows("tags").await.len(), 2);
}

#[tokio::test]
async fn failed_batch_does_not_fail_the_table() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    for id in 0..250 {
        h.source.push_row("orders", order(id, "2024-04-01T00:00:00Z")).await;
    }
    h.source.queue_timestamps([T0]).await;
    h.destination.fail_batch("orders", 1).await;

    let engine = h.engine(config(&dir, &["orders"]));
    let result = engine.run().await;

    let orders = result.table("orders").unwrap();
    assert!(orders.success);
    assert_eq!(orders.rows_loaded, 150);
    assert_eq!(orders.rows_failed, 100);
    assert_eq!(orders.batches_loaded, 2);
    assert_eq!(orders.batches_failed, 1);
    assert_eq!(orders.checkpoint.as_deref(), Some(T0));
    assert_eq!(h.destination.insert_calls("orders").await, 3);
    assert_eq!(h.destination.rows("orders").await.len(), 150);

    let metrics = engine.metrics().snapshot();
    assert_eq!(metrics.rows_failed, 100);
    assert_eq!(metrics.batches_failed, 1);
}

#[tokio::test]
async fn destination_schema_comes_from_first_row_only() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source
        .push_row("events", Row::new().with("a", 1i64).with("b", 2i64))
        .await;
    h.source
        .push_row(
            "events",
            Row::new().with("a", 3i64).with("b", 4i64).with("c", 5i64),
        )
        .await;

    let engine = h.engine(config(&dir, &["events"]));
    engine.run().await;
    engine.run().await;

    assert_eq!(h.destination.columns("events").await.unwrap(), vec!["a", "b"]);
    let rows = h.destination.rows("events").await;
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| !r.contains("c")));
    assert_eq!(rows[1].value("b"), Some("4"));
}

#[tokio::test]
async fn table_that_never_appears_fails_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.push_row("customers", order(7, "2024-04-01T00:00:00Z")).await;
    h.destination.hide_table("orders").await;

    let result = h.engine(config(&dir, &["orders", "customers"])).run().await;

    assert!(!result.success);
    let orders = result.table("orders").unwrap();
    assert!(!orders.success);
    assert!(orders.error.as_deref().unwrap().contains("5 existence checks"));
    assert_eq!(orders.checkpoint, None);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(2); 4]);

    // Later tables still run
    assert!(result.table("customers").unwrap().success);
    let state = stored_state(&dir);
    assert_eq!(state.get("orders"), None);
    assert!(state.get("customers").is_some());
}

#[tokio::test]
async fn extraction_failure_keeps_previous_checkpoint() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("broken", T0)]);

    let h = Harness::new();
    h.source.add_table("broken", &["id", "created_at"]).await;
    h.source.fail_table("broken").await;
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.queue_timestamps([T1, T2]).await;

    let result = h.engine(config(&dir, &["broken", "orders"])).run().await;

    let broken = result.table("broken").unwrap();
    assert!(!broken.success);
    assert_eq!(broken.checkpoint.as_deref(), Some(T0));
    assert!(result.table("orders").unwrap().success);

    let state = stored_state(&dir);
    assert_eq!(state.get("broken"), Some(T0));
    assert_eq!(state.get("orders"), Some(T2));
    assert_eq!(result.failed_tables().count(), 1);
}

#[tokio::test]
async fn empty_extraction_still_advances_checkpoint() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("orders", T0)]);

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.queue_timestamps([T1]).await;

    let result = h.engine(config(&dir, &["orders"])).run().await;

    let orders = result.table("orders").unwrap();
    assert_eq!(orders.rows_extracted, 0);
    assert_eq!(orders.checkpoint.as_deref(), Some(T1));
    assert_eq!(h.destination.columns("orders").await, None);
    assert_eq!(h.destination.insert_calls("orders").await, 0);
}

#[tokio::test]
async fn column_lookup_failure_treats_table_as_untracked() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("orders", T0)]);

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-05-01T09:00:00Z")).await;
    h.source.push_row("orders", order(2, "2024-05-01T10:30:00Z")).await;
    h.source.fail_column_lookup("orders").await;
    h.source.queue_timestamps([T1]).await;

    let result = h.engine(config(&dir, &["orders"])).run().await;

    let orders = result.table("orders").unwrap();
    assert!(orders.success);
    assert_eq!(orders.mode, SyncMode::Full);
    assert_eq!(orders.rows_extracted, 2);
    assert_eq!(orders.checkpoint.as_deref(), Some(T0));
    assert!(h
        .source
        .queries()
        .await
        .contains(&SourceQuery::FetchAll("orders".into())));
    assert_eq!(stored_state(&dir).get("orders"), Some(T0));
}

#[tokio::test]
async fn source_clock_failure_falls_back_to_local_clock() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.fail_clock().await;

    let before = Utc::now() - chrono::Duration::seconds(1);
    let result = h.engine(config(&dir, &["orders"])).run().await;
    let after = Utc::now() + chrono::Duration::seconds(1);

    let orders = result.table("orders").unwrap();
    assert!(orders.success);
    assert_eq!(orders.mode, SyncMode::Full);
    assert_eq!(orders.rows_loaded, 1);

    let checkpoint = ts(orders.checkpoint.as_deref().unwrap());
    assert!(before <= checkpoint && checkpoint <= after);
    assert_eq!(
        stored_state(&dir).get("orders"),
        orders.checkpoint.as_deref()
    );
}

#[tokio::test]
async fn full_refresh_ignores_existing_checkpoint() {
    let dir = TempDir::new().unwrap();
    seed_state(&dir, &[("orders", T0)]);

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.queue_timestamps([T1]).await;

    let mut config = config(&dir, &["orders"]);
    config.sync.full_refresh = true;
    let result = h.engine(config).run().await;

    let orders = result.table("orders").unwrap();
    assert_eq!(orders.mode, SyncMode::Full);
    assert_eq!(orders.rows_loaded, 1);
    assert_eq!(orders.checkpoint.as_deref(), Some(T1));
}

#[tokio::test]
async fn corrupt_state_document_starts_fresh() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "{not json").unwrap();

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.queue_timestamps([T0]).await;

    let result = h.engine(config(&dir, &["orders"])).run().await;

    assert_eq!(result.table("orders").unwrap().mode, SyncMode::Full);
    assert_eq!(stored_state(&dir).get("orders"), Some(T0));
}

#[tokio::test]
async fn dry_run_leaves_state_document_alone() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;

    let result = h
        .engine(config(&dir, &["orders"]))
        .with_dry_run(true)
        .run()
        .await;

    assert!(result.success);
    assert!(!result.checkpoint_saved);
    assert!(!std::path::Path::new(&state_path(&dir)).exists());
}

#[tokio::test]
async fn dry_run_does_not_rewrite_corrupt_state_document() {
    let dir = TempDir::new().unwrap();
    std::fs::write(state_path(&dir), "{not json").unwrap();

    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;

    let result = h
        .engine(config(&dir, &["orders"]))
        .with_dry_run(true)
        .run()
        .await;

    assert!(result.success);
    assert_eq!(
        std::fs::read_to_string(state_path(&dir)).unwrap(),
        "{not json"
    );
}

#[tokio::test]
async fn unwritable_state_document_does_not_fail_the_run() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;

    let mut config = config(&dir, &["orders"]);
    config.sync.state_file = dir
        .path()
        .join("missing")
        .join("sync_state.json")
        .display()
        .to_string();
    let result = h.engine(config).run().await;

    assert!(result.success);
    assert!(!result.checkpoint_saved);
}

#[tokio::test]
async fn sync_tables_updates_state_in_place() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;
    h.source.queue_timestamps([T0]).await;

    let engine = h.engine(config(&dir, &["orders"]));
    let mut state = SyncState::new();
    let result = engine.sync_tables(&mut state).await;

    assert!(result.success);
    assert_eq!(state.get("orders"), Some(T0));
    // Only `run` touches the document
    assert!(!std::path::Path::new(&state_path(&dir)).exists());
}

#[tokio::test]
async fn progress_reports_each_phase() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new();
    h.source.push_row("orders", order(1, "2024-04-01T00:00:00Z")).await;

    let phases = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&phases);
    let engine = h
        .engine(config(&dir, &["orders"]))
        .with_progress(move |p| seen.lock().unwrap().push(p.phase));
    engine.run().await;

    assert_eq!(
        *phases.lock().unwrap(),
        vec![
            SyncPhase::Capturing,
            SyncPhase::Fetching,
            SyncPhase::Reconciling,
            SyncPhase::Loading,
            SyncPhase::Completed,
        ]
    );
}

#[test]
fn table_not_ready_error_code() {
    let err = Error::TableNotReady {
        table: "orders".into(),
        attempts: 5,
    };
    assert_eq!(err.code(), "TABLE_NOT_READY");
}
