//! CDC pipeline tests against an in-process replication source.
//!
//! These cover the run lifecycle end to end: first-run snapshot, streaming,
//! acknowledgement, replay after a failed write, and recovery from a lost
//! slot.

mod common;

use async_trait::async_trait;
use ch_sync::cdc::{shape_events, CdcPipeline};
use ch_sync::config::{CdcConfig, StreamConfig, Transform};
use ch_sync::SyncPipeline;
use ch_sync_postgresql_wal2json_source::{PostgreSQLLogicalCheckpoint, StreamOptions};
use checkpoint::{load_checkpoint, FilesystemStore, MemoryStore, State, StateID, StateStore, SyncPhase};
use clickhouse_sink::{MemoryWarehouse, Warehouse};
use common::{Change, FakeDatabase};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{ChangeEvent, Lsn, Operation, Record, SyncError, WriteBatch, WriteRow};
use tokio_util::sync::CancellationToken;

const CONNECTION: &str = "postgresql://sync@db.internal:5432/shop";
const ORDERS: &str = "shop___orders";

fn orders_stream() -> StreamConfig {
    StreamConfig {
        slot: "ch_sync_orders".into(),
        publication: "ch_sync_orders_pub".into(),
        target: None,
        transform: Transform::Raw,
        names: Vec::new(),
    }
}

fn cdc_config(tables: &[&str], stream: StreamConfig) -> CdcConfig {
    CdcConfig {
        schema: "public".into(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
        streams: vec![stream],
        batch_size: 100,
        max_duration: None,
        max_records: None,
        stop_when_caught_up: true,
        poll_interval: None,
    }
}

fn fast_streaming() -> StreamOptions {
    StreamOptions {
        poll_interval: Duration::from_millis(10),
        min_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn pipeline(
    db: &FakeDatabase,
    warehouse: Arc<dyn Warehouse>,
    state: StateStore,
    config: CdcConfig,
) -> CdcPipeline {
    CdcPipeline::new(
        "orders_cdc",
        "shop",
        CONNECTION,
        config,
        Arc::new(db.clone()),
        warehouse,
        state,
    )
    .unwrap()
    .with_stream_options(fast_streaming())
}

fn memory_state() -> StateStore {
    StateStore::new(Arc::new(MemoryStore::new()))
}

fn order(id: i64, status: &str) -> Value {
    json!({"id": id, "status": status, "customer": format!("c{id}")})
}

fn statuses(warehouse: &MemoryWarehouse, table: &str) -> Vec<(i64, String)> {
    warehouse
        .visible_rows(table)
        .iter()
        .map(|r| {
            (
                r["id"].as_i64().unwrap(),
                r["status"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

fn state_id() -> StateID {
    StateID::from_connection_and_slot("orders_cdc", CONNECTION, "ch_sync_orders")
}

#[tokio::test]
async fn test_first_run_snapshots_then_later_runs_stream() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));
    db.insert("orders", order(2, "new"));

    let dir = tempfile::tempdir().unwrap();
    let state = StateStore::new(Arc::new(FilesystemStore::new(dir.path())));
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), state.clone(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();

    let stats = cdc.run(&cancel).await.unwrap();
    assert_eq!(stats.rows_merged, 2);
    assert_eq!(db.snapshots(), 1);
    assert_eq!(state.get_state(&state_id()).await.unwrap(), Some(State::Incremental));
    assert_eq!(
        statuses(&warehouse, ORDERS),
        vec![(1, "new".to_string()), (2, "new".to_string())]
    );

    db.insert("orders", order(3, "new"));
    let last = db.update("orders", order(1, "shipped"));

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.snapshots(), 1, "second run must not snapshot again");
    assert_eq!(
        statuses(&warehouse, ORDERS),
        vec![
            (1, "shipped".to_string()),
            (2, "new".to_string()),
            (3, "new".to_string())
        ]
    );
    assert_eq!(db.confirmed_lsn(), Some(last));

    let acknowledged: PostgreSQLLogicalCheckpoint = load_checkpoint(
        state.checkpoints().as_ref(),
        &state_id().scope(),
        SyncPhase::Acknowledged,
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(acknowledged.lsn, last);
}

#[tokio::test]
async fn test_run_history_survives_restart() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    {
        let state = StateStore::new(Arc::new(FilesystemStore::new(dir.path())));
        let warehouse = Arc::new(MemoryWarehouse::new());
        pipeline(&db, warehouse, state, cdc_config(&["orders"], orders_stream()))
            .run(&cancel)
            .await
            .unwrap();
    }

    db.insert("orders", order(2, "new"));
    let state = StateStore::new(Arc::new(FilesystemStore::new(dir.path())));
    let warehouse = Arc::new(MemoryWarehouse::new());
    pipeline(&db, warehouse.clone(), state, cdc_config(&["orders"], orders_stream()))
        .run(&cancel)
        .await
        .unwrap();

    assert_eq!(db.snapshots(), 1);
    // Only the streamed row reaches the fresh warehouse.
    assert_eq!(statuses(&warehouse, ORDERS), vec![(2, "new".to_string())]);
}

#[tokio::test]
async fn test_rerun_without_changes_leaves_destination_unchanged() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));
    db.insert("orders", order(2, "paid"));

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();

    cdc.run(&cancel).await.unwrap();
    let before = warehouse.visible_rows(ORDERS);
    let merges = warehouse.merge_count();
    let confirmed = db.confirmed_lsn();

    let stats = cdc.run(&cancel).await.unwrap();
    assert_eq!(stats.rows_merged, 0);
    assert_eq!(warehouse.visible_rows(ORDERS), before);
    assert_eq!(warehouse.merge_count(), merges);
    assert_eq!(db.confirmed_lsn(), confirmed);
}

#[tokio::test]
async fn test_deleted_rows_are_not_observable() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));
    db.insert("orders", order(2, "new"));

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    db.delete("orders", 1);
    cdc.run(&cancel).await.unwrap();

    assert_eq!(statuses(&warehouse, ORDERS), vec![(2, "new".to_string())]);
}

#[tokio::test]
async fn test_transaction_is_applied_whole() {
    let db = FakeDatabase::new();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();
    assert!(warehouse.visible_rows(ORDERS).is_empty());

    db.commit(vec![
        Change::Insert("orders", order(10, "new")),
        Change::Update("orders", order(10, "paid")),
        Change::Insert("orders", order(11, "new")),
    ]);
    cdc.run(&cancel).await.unwrap();

    // Both changes to id 10 share the commit LSN; the later one wins.
    assert_eq!(
        statuses(&warehouse, ORDERS),
        vec![(10, "paid".to_string()), (11, "new".to_string())]
    );
}

/// Merges the batch, then reports a failure once, like a process that dies
/// after writing but before acknowledging.
struct FailAfterMerge {
    inner: Arc<MemoryWarehouse>,
    fail: AtomicBool,
}

#[async_trait]
impl Warehouse for FailAfterMerge {
    async fn table_exists(&self, table: &str) -> sync_core::Result<bool> {
        self.inner.table_exists(table).await
    }

    async fn max_value(&self, table: &str, column: &str) -> sync_core::Result<Option<String>> {
        self.inner.max_value(table, column).await
    }

    async fn merge(&self, batch: &WriteBatch) -> sync_core::Result<()> {
        self.inner.merge(batch).await?;
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Destination {
                context: "Failed to merge batch".into(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection closed before response",
                )),
            });
        }
        Ok(())
    }

    async fn retire_older_than(&self, table: &str, version: u64) -> sync_core::Result<()> {
        self.inner.retire_older_than(table, version).await
    }

    async fn execute(&self, sql: &str) -> sync_core::Result<()> {
        self.inner.execute(sql).await
    }
}

#[tokio::test]
async fn test_batch_written_but_not_acknowledged_is_replayed() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));

    let memory = Arc::new(MemoryWarehouse::new());
    let warehouse = Arc::new(FailAfterMerge {
        inner: memory.clone(),
        fail: AtomicBool::new(false),
    });
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();
    let snapshot_point = db.confirmed_lsn();

    db.update("orders", order(1, "paid"));
    let last = db.insert("orders", order(2, "new"));

    warehouse.fail.store(true, Ordering::SeqCst);
    assert!(cdc.run(&cancel).await.is_err());
    assert_eq!(db.confirmed_lsn(), snapshot_point, "failed batch must not be acknowledged");
    let after_failure = memory.visible_rows(ORDERS);

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.confirmed_lsn(), Some(last));
    assert_eq!(memory.visible_rows(ORDERS), after_failure);
    assert_eq!(
        statuses(&memory, ORDERS),
        vec![(1, "paid".to_string()), (2, "new".to_string())]
    );
}

fn event(operation: Operation, row: Value, lsn: u64) -> ChangeEvent {
    let row: Record = match row {
        Value::Object(map) => map,
        _ => Record::new(),
    };
    ChangeEvent {
        schema: "public".into(),
        table: "orders".into(),
        operation,
        key_columns: vec!["id".into()],
        row,
        lsn: Lsn(lsn),
    }
}

#[tokio::test]
async fn test_snapshot_and_stream_commute() {
    let stream = orders_stream();
    let snapshot = vec![
        event(Operation::Insert, order(1, "new"), 0x100),
        event(Operation::Insert, order(2, "new"), 0x100),
    ];
    let changes = vec![
        event(Operation::Update, order(1, "shipped"), 0x180),
        event(Operation::Delete, json!({"id": 2}), 0x200),
        event(Operation::Insert, order(3, "new"), 0x200),
    ];

    let snapshot_first = MemoryWarehouse::new();
    let stream_first = MemoryWarehouse::new();
    for batch in shape_events(&stream, "shop", &snapshot) {
        snapshot_first.merge(&batch).await.unwrap();
    }
    for batch in shape_events(&stream, "shop", &changes) {
        snapshot_first.merge(&batch).await.unwrap();
        stream_first.merge(&batch).await.unwrap();
    }
    for batch in shape_events(&stream, "shop", &snapshot) {
        stream_first.merge(&batch).await.unwrap();
    }

    assert_eq!(snapshot_first.visible_rows(ORDERS), stream_first.visible_rows(ORDERS));
    assert_eq!(
        statuses(&stream_first, ORDERS),
        vec![(1, "shipped".to_string()), (3, "new".to_string())]
    );
}

#[tokio::test]
async fn test_lost_slot_triggers_new_snapshot() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));

    let state = memory_state();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), state.clone(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    db.lose_slot();
    // Committed while no slot retains WAL: only a snapshot can recover it.
    db.insert("orders", order(2, "new"));

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.snapshots(), 2);
    assert_eq!(state.get_state(&state_id()).await.unwrap(), Some(State::Incremental));
    assert_eq!(
        statuses(&warehouse, ORDERS),
        vec![(1, "new".to_string()), (2, "new".to_string())]
    );
}

#[tokio::test]
async fn test_rows_deleted_while_the_slot_was_lost_are_retired() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));
    db.insert("orders", order(2, "new"));

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    db.lose_slot();
    db.delete("orders", 2);

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.snapshots(), 2);
    assert_eq!(db.rows("orders").len(), 1);
    assert_eq!(statuses(&warehouse, ORDERS), vec![(1, "new".to_string())]);

    // The retired row stays gone on later runs.
    db.update("orders", order(1, "paid"));
    cdc.run(&cancel).await.unwrap();
    assert_eq!(statuses(&warehouse, ORDERS), vec![(1, "paid".to_string())]);
}

#[tokio::test]
async fn test_interrupted_snapshot_is_taken_again() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));

    let state = memory_state();
    state.transition(&state_id(), State::Pending).await.unwrap();
    state
        .transition(&state_id(), State::Initial { pre_lsn: "0/1600000".into() })
        .await
        .unwrap();

    // Left behind by the interrupted attempt; the source row is gone since.
    let warehouse = Arc::new(MemoryWarehouse::new());
    let mut leftover = WriteBatch::new(ORDERS, vec!["id".to_string()]);
    leftover.push(WriteRow::upsert(
        order(9, "new").as_object().unwrap().clone(),
        0x1600000,
    ));
    warehouse.merge(&leftover).await.unwrap();

    let cdc = pipeline(&db, warehouse.clone(), state.clone(), cdc_config(&["orders"], orders_stream()));
    cdc.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(db.snapshots(), 1);
    assert_eq!(state.get_state(&state_id()).await.unwrap(), Some(State::Incremental));
    assert_eq!(statuses(&warehouse, ORDERS), vec![(1, "new".to_string())]);
}

fn tailing_stream(slot: &str, target: &str) -> StreamConfig {
    StreamConfig {
        slot: slot.into(),
        publication: format!("{slot}_pub"),
        target: Some(target.into()),
        transform: Transform::Raw,
        names: Vec::new(),
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_every_stream_is_tailed_at_once() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));

    let mut config = cdc_config(&["orders"], tailing_stream("slot_a", "orders_a"));
    config.streams.push(tailing_stream("slot_b", "orders_b"));
    config.stop_when_caught_up = false;

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), config);
    let cancel = CancellationToken::new();

    let both_have = |rows: usize| {
        warehouse.visible_rows("shop___orders_a").len() == rows
            && warehouse.visible_rows("shop___orders_b").len() == rows
    };
    let driver = async {
        wait_until(|| both_have(1)).await;
        db.insert("orders", order(2, "new"));
        wait_until(|| both_have(2)).await;
        cancel.cancel();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(cdc.run(&cancel), driver)
    })
    .await
    .expect("both streams should snapshot and stream");
    let stats = result.unwrap();

    assert_eq!(db.snapshots(), 2);
    assert_eq!(stats.tables["shop___orders_a"], 2);
    assert_eq!(stats.tables["shop___orders_b"], 2);
    assert!(db.slot_lsn("slot_a").is_some());
    assert!(db.slot_lsn("slot_b").is_some());
}

#[tokio::test]
async fn test_reset_forgets_slot_and_history() {
    let db = FakeDatabase::new();
    db.insert("orders", order(1, "new"));

    let state = memory_state();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), state.clone(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    cdc.reset().await.unwrap();
    assert_eq!(db.confirmed_lsn(), None);
    assert_eq!(state.get_state(&state_id()).await.unwrap(), None);

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.snapshots(), 2);
}

#[tokio::test]
async fn test_transient_connection_failures_are_retried() {
    let db = FakeDatabase::new();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), cdc_config(&["orders"], orders_stream()));
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    db.insert("orders", order(5, "new"));
    db.fail_next_opens(2);
    let opens = db.opens();

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.opens(), opens + 3);
    assert_eq!(statuses(&warehouse, ORDERS), vec![(5, "new".to_string())]);
}

#[tokio::test]
async fn test_record_limit_stops_after_whole_batches() {
    let db = FakeDatabase::new();
    let mut config = cdc_config(&["orders"], orders_stream());
    config.batch_size = 1;
    config.max_records = Some(1);

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse.clone(), memory_state(), config);
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    let first = db.insert("orders", order(1, "new"));
    let last = db.insert("orders", order(2, "new"));

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.confirmed_lsn(), Some(first));
    assert_eq!(statuses(&warehouse, ORDERS), vec![(1, "new".to_string())]);

    cdc.run(&cancel).await.unwrap();
    assert_eq!(db.confirmed_lsn(), Some(last));
}

#[tokio::test]
async fn test_duration_limit_ends_a_tailing_run() {
    let db = FakeDatabase::new();
    let mut config = cdc_config(&["orders"], orders_stream());
    config.stop_when_caught_up = false;
    config.max_duration = Some("1s".into());

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse, memory_state(), config);

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(10), cdc.run(&CancellationToken::new()))
        .await
        .expect("run should stop at its duration limit")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancel_stops_a_tailing_run() {
    let db = FakeDatabase::new();
    let mut config = cdc_config(&["orders"], orders_stream());
    config.stop_when_caught_up = false;

    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(&db, warehouse, memory_state(), config);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    tokio::time::timeout(Duration::from_secs(10), cdc.run(&cancel))
        .await
        .expect("run should stop once cancelled")
        .unwrap();
}

fn ad_log(id: i64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "related_user_id": 501,
        "created_at": "2024-02-28 12:00:00",
        "data": {"kwargs": {
            "params": {
                "pickUpDate": "2024-03-01",
                "dropOffDate": "2024-03-05",
                "pickUpLocation": {"locationQuery": "Faro Airport"},
                "dropOffLocation": {"locationQuery": "Lisbon"}
            },
            "inlineItems": [
                {"rank": 1, "site": "rentals.example", "cpcEstimate": 0.35},
                {"rank": 2, "site": "cars.example", "cpcEstimate": "0.5"}
            ],
            "os": "android",
            "country": "PT"
        }}
    })
}

#[tokio::test]
async fn test_inline_ad_logs_are_flattened_from_snapshot_and_stream() {
    let db = FakeDatabase::new();
    db.insert("server_logs_log", ad_log(77, "InlineAdsViewSet.car"));
    db.insert("server_logs_log", ad_log(78, "UserViewSet.login"));

    let stream = StreamConfig {
        slot: "ch_sync_inline_ads".into(),
        publication: "ch_sync_inline_ads_pub".into(),
        target: Some("inline_ads".into()),
        transform: Transform::InlineAds,
        names: vec!["InlineAdsViewSet.car".into()],
    };
    let warehouse = Arc::new(MemoryWarehouse::new());
    let cdc = pipeline(
        &db,
        warehouse.clone(),
        memory_state(),
        cdc_config(&["server_logs_log"], stream),
    );
    let cancel = CancellationToken::new();
    cdc.run(&cancel).await.unwrap();

    db.insert("server_logs_log", ad_log(79, "InlineAdsViewSet.car"));
    db.delete("server_logs_log", 77);
    cdc.run(&cancel).await.unwrap();

    let rows = warehouse.visible_rows("shop___inline_ads");
    let ids: Vec<&str> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
    // Log deletes are ignored; the filtered-out login row yields nothing.
    assert_eq!(ids, vec!["77-1", "77-2", "79-1", "79-2"]);
    for row in &rows {
        assert_eq!(row["start_date"], json!("2024-03-01"));
        assert_eq!(row["destination"], json!("Lisbon"));
        assert_eq!(row["os"], json!("android"));
    }
}
