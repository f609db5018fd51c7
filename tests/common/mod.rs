//! In-process stand-in for a PostgreSQL server with wal2json slots.
//!
//! Committed transactions are appended to a WAL as wal2json (format version
//! 2) messages with increasing LSNs. Each slot peeks whole transactions past
//! its confirmed position, like `pg_logical_slot_peek_changes`, and only
//! moves when advanced.

#![allow(dead_code)]

use async_trait::async_trait;
use ch_sync_postgresql_wal2json_source::{
    ChangeFeed, ReplicationOptions, ReplicationSource, Snapshot, WalMessage,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use sync_core::{ChangeEvent, Lsn, Operation, Record, Result, SyncError};

#[derive(Debug, Default)]
struct SlotState {
    confirmed: Lsn,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, BTreeMap<i64, Record>>,
    wal: Vec<WalMessage>,
    last_lsn: u64,
    slots: BTreeMap<String, SlotState>,
    failing_opens: usize,
    opens: usize,
    snapshots: usize,
}

impl Inner {
    fn next_lsn(&mut self) -> Lsn {
        self.last_lsn += 0x10;
        Lsn(self.last_lsn)
    }
}

/// A row change inside a transaction.
pub enum Change {
    Insert(&'static str, Value),
    Update(&'static str, Value),
    Delete(&'static str, i64),
}

#[derive(Clone)]
pub struct FakeDatabase(Arc<Mutex<Inner>>);

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn pg_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "bigint",
        Value::Number(_) => "double precision",
        Value::Object(_) | Value::Array(_) => "jsonb",
        _ => "text",
    }
}

fn wal_value(value: &Value) -> Value {
    match value {
        // wal2json renders jsonb columns as their text
        Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

fn columns(row: &Record) -> Vec<Value> {
    row.iter()
        .map(|(name, value)| json!({"name": name, "type": pg_type(value), "value": wal_value(value)}))
        .collect()
}

fn record(row: Value) -> Record {
    match row {
        Value::Object(map) => map,
        other => panic!("rows must be JSON objects, got {other}"),
    }
}

fn id_of(row: &Record) -> i64 {
    row.get("id")
        .and_then(Value::as_i64)
        .expect("rows need an integer id")
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            last_lsn: 0x1600000,
            ..Default::default()
        })))
    }

    /// Commit one transaction, returning its commit LSN.
    pub fn commit(&self, changes: Vec<Change>) -> Lsn {
        let mut inner = self.0.lock().unwrap();
        let begin = inner.next_lsn();
        inner.wal.push(WalMessage {
            lsn: begin,
            data: json!({"action": "B"}).to_string(),
        });

        for change in changes {
            let (action, table, message_row) = match change {
                Change::Insert(table, row) => {
                    let row = record(row);
                    inner
                        .tables
                        .entry(table.to_string())
                        .or_default()
                        .insert(id_of(&row), row.clone());
                    ("I", table, row)
                }
                Change::Update(table, row) => {
                    let row = record(row);
                    inner
                        .tables
                        .entry(table.to_string())
                        .or_default()
                        .insert(id_of(&row), row.clone());
                    ("U", table, row)
                }
                Change::Delete(table, id) => {
                    if let Some(rows) = inner.tables.get_mut(table) {
                        rows.remove(&id);
                    }
                    ("D", table, record(json!({"id": id})))
                }
            };

            let mut message = json!({
                "action": action,
                "schema": "public",
                "table": table,
                "pk": [{"name": "id", "type": "bigint"}],
            });
            let key = if action == "D" { "identity" } else { "columns" };
            message[key] = Value::Array(columns(&message_row));

            let lsn = inner.next_lsn();
            inner.wal.push(WalMessage {
                lsn,
                data: message.to_string(),
            });
        }

        let commit = inner.next_lsn();
        inner.wal.push(WalMessage {
            lsn: commit,
            data: json!({"action": "C"}).to_string(),
        });
        commit
    }

    pub fn insert(&self, table: &'static str, row: Value) -> Lsn {
        self.commit(vec![Change::Insert(table, row)])
    }

    pub fn update(&self, table: &'static str, row: Value) -> Lsn {
        self.commit(vec![Change::Update(table, row)])
    }

    pub fn delete(&self, table: &'static str, id: i64) -> Lsn {
        self.commit(vec![Change::Delete(table, id)])
    }

    /// Current contents of `table`, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        let inner = self.0.lock().unwrap();
        inner
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Confirmed position of the first slot, by name.
    pub fn confirmed_lsn(&self) -> Option<Lsn> {
        self.0.lock().unwrap().slots.values().next().map(|s| s.confirmed)
    }

    pub fn slot_lsn(&self, slot: &str) -> Option<Lsn> {
        self.0.lock().unwrap().slots.get(slot).map(|s| s.confirmed)
    }

    /// Simulate every slot being dropped behind the pipeline's back.
    pub fn lose_slot(&self) {
        self.0.lock().unwrap().slots.clear();
    }

    /// Make the next `n` attempts to open the slot fail as if the server
    /// dropped the connection.
    pub fn fail_next_opens(&self, n: usize) {
        self.0.lock().unwrap().failing_opens = n;
    }

    pub fn opens(&self) -> usize {
        self.0.lock().unwrap().opens
    }

    pub fn snapshots(&self) -> usize {
        self.0.lock().unwrap().snapshots
    }
}

fn connection_lost() -> SyncError {
    SyncError::Connection {
        context: "Failed to open replication slot".into(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )),
    }
}

struct FakeFeed {
    inner: Arc<Mutex<Inner>>,
    slot: String,
}

fn slot_missing(slot: &str) -> SyncError {
    SyncError::replication(format!("replication slot \"{slot}\" does not exist"))
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn peek(&self, max_changes: usize) -> Result<Vec<WalMessage>> {
        let inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get(&self.slot)
            .ok_or_else(|| slot_missing(&self.slot))?;

        // Decoding stops at the first commit after `max_changes` messages.
        let mut peeked = Vec::new();
        for message in inner.wal.iter().filter(|m| m.lsn > slot.confirmed) {
            let is_commit = message.data.contains("\"action\":\"C\"");
            peeked.push(message.clone());
            if is_commit && peeked.len() >= max_changes {
                break;
            }
        }
        Ok(peeked)
    }

    async fn advance(&self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .slots
            .get_mut(&self.slot)
            .ok_or_else(|| slot_missing(&self.slot))?;
        assert!(lsn >= slot.confirmed, "slot moved backwards");
        slot.confirmed = lsn;
        Ok(())
    }
}

#[async_trait]
impl ReplicationSource for FakeDatabase {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        Ok(self.0.lock().unwrap().slots.contains_key(slot_name))
    }

    async fn init_replication(&self, options: &ReplicationOptions) -> Result<Snapshot> {
        let mut inner = self.0.lock().unwrap();
        if inner.slots.contains_key(&options.slot_name) && !options.reset {
            return Err(SyncError::replication(format!(
                "replication slot \"{}\" already exists",
                options.slot_name
            )));
        }
        inner.snapshots += 1;
        let consistent = Lsn(inner.last_lsn);
        inner.slots.insert(
            options.slot_name.clone(),
            SlotState {
                confirmed: consistent,
            },
        );

        if !options.persist_snapshot {
            return Ok(Snapshot::new(consistent, None));
        }

        // Pinned now: rows committed after this point only arrive through
        // the slot.
        let mut events = Vec::new();
        for table in &options.table_names {
            for row in inner.tables.get(table).into_iter().flat_map(|t| t.values()) {
                events.push(ChangeEvent {
                    schema: options.schema.clone(),
                    table: table.clone(),
                    operation: Operation::Insert,
                    key_columns: vec!["id".to_string()],
                    row: row.clone(),
                    lsn: consistent,
                });
            }
        }
        let batches: Vec<Result<Vec<ChangeEvent>>> = events
            .chunks(options.batch_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(Snapshot::new(
            consistent,
            Some(Box::pin(futures::stream::iter(batches))),
        ))
    }

    async fn open_feed(&self, options: &ReplicationOptions) -> Result<Box<dyn ChangeFeed>> {
        let mut inner = self.0.lock().unwrap();
        inner.opens += 1;
        if inner.failing_opens > 0 {
            inner.failing_opens -= 1;
            return Err(connection_lost());
        }
        if !inner.slots.contains_key(&options.slot_name) {
            return Err(slot_missing(&options.slot_name));
        }
        Ok(Box::new(FakeFeed {
            inner: self.0.clone(),
            slot: options.slot_name.clone(),
        }))
    }

    async fn drop_replication(&self, options: &ReplicationOptions) -> Result<()> {
        self.0.lock().unwrap().slots.remove(&options.slot_name);
        Ok(())
    }
}
