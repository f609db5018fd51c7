//! Decoding of wal2json (format version 2) output.
//!
//! With `include-transaction` every transaction is framed by a `B` (begin)
//! and a `C` (commit) message; row changes in between are `I`, `U` and `D`.
//! Row changes are buffered until their commit is seen and then stamped with
//! the commit LSN, which orders them against snapshot rows and against each
//! other.

use ch_sync_postgresql::value::convert_text_value;
use serde_json::Value;
use sync_core::{ChangeEvent, Lsn, Operation, Record, Result, SyncError};
use tracing::{debug, warn};

/// One row of `pg_logical_slot_peek_changes` output.
#[derive(Debug, Clone, PartialEq)]
pub struct WalMessage {
    pub lsn: Lsn,
    pub data: String,
}

/// Parses a wal2json formatted string into a JSON object
///
/// # Example
/// ```ignore
/// let parsed = parse_wal2json(r#"{"action":"B"}"#)?;
/// ```
pub fn parse_wal2json(input: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(input)
        .map_err(|e| SyncError::replication(format!("Failed to parse wal2json output as JSON: {e}")))?;

    if !value.is_object() {
        return Err(SyncError::replication(format!(
            "Expected wal2json output to be a JSON object, got: {value}"
        )));
    }

    Ok(value)
}

/// A row change before its transaction has committed.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub key_columns: Vec<String>,
    pub row: Record,
}

impl RowChange {
    fn at(self, lsn: Lsn) -> ChangeEvent {
        ChangeEvent {
            schema: self.schema,
            table: self.table,
            operation: self.operation,
            key_columns: self.key_columns,
            row: self.row,
            lsn,
        }
    }
}

/// A decoded wal2json message
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Begin,
    Commit,
    Change(RowChange),
    /// Messages this decoder does not use (logical messages, truncates)
    Other(String),
}

/// Converts a parsed wal2json message into an [`Action`].
pub fn decode_action(message: &Value) -> Result<Action> {
    let obj = message
        .as_object()
        .ok_or_else(|| SyncError::replication("wal2json value must be an object"))?;

    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::replication("Missing or invalid 'action' field"))?;

    let operation = match action {
        "B" => return Ok(Action::Begin),
        "C" => return Ok(Action::Commit),
        "I" => Operation::Insert,
        "U" => Operation::Update,
        "D" => Operation::Delete,
        other => return Ok(Action::Other(other.to_string())),
    };

    let schema = obj
        .get("schema")
        .and_then(Value::as_str)
        .unwrap_or("public")
        .to_string();
    let table = obj
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::data("Missing 'table' field"))?
        .to_string();

    // Deletes carry the replica identity instead of the full row
    let columns = if operation == Operation::Delete {
        obj.get("identity").or_else(|| obj.get("columns"))
    } else {
        obj.get("columns")
    }
    .and_then(Value::as_array)
    .map(Vec::as_slice)
    .unwrap_or(&[]);

    let mut row = Record::new();
    for col in columns {
        let name = col
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::data(format!("Column in {table} missing 'name' field")))?;
        let pg_type = col.get("type").and_then(Value::as_str).unwrap_or("text");
        let value = convert_text_value(col.get("value"), pg_type)
            .map_err(|e| SyncError::data(format!("{schema}.{table}.{name}: {e}")))?;
        row.insert(name.to_string(), value);
    }

    let mut key_columns: Vec<String> = obj
        .get("pk")
        .and_then(Value::as_array)
        .map(|pks| {
            pks.iter()
                .filter_map(|pk| pk.get("name").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default();
    if key_columns.is_empty() {
        key_columns = if operation == Operation::Delete && !row.is_empty() {
            row.keys().cloned().collect()
        } else {
            vec!["id".to_string()]
        };
    }

    Ok(Action::Change(RowChange {
        schema,
        table,
        operation,
        key_columns,
        row,
    }))
}

/// Changes decoded from one peek.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedBatch {
    pub events: Vec<ChangeEvent>,
    /// LSN of the last complete transaction; acknowledging it consumes
    /// everything in `events`.
    pub commit_lsn: Option<Lsn>,
    /// Malformed rows that were dropped.
    pub dropped: usize,
}

/// Group peeked messages into committed transactions.
///
/// A trailing transaction without its commit is left out (and left
/// unacknowledged) so it is delivered again, whole, by the next peek.
pub fn decode_messages(messages: &[WalMessage]) -> Result<DecodedBatch> {
    let mut batch = DecodedBatch::default();
    let mut pending: Vec<RowChange> = Vec::new();

    for message in messages {
        let value = parse_wal2json(&message.data)?;
        match decode_action(&value) {
            Ok(Action::Begin) => pending.clear(),
            Ok(Action::Commit) => {
                batch
                    .events
                    .extend(pending.drain(..).map(|change| change.at(message.lsn)));
                batch.commit_lsn = Some(message.lsn);
            }
            Ok(Action::Change(change)) => pending.push(change),
            Ok(Action::Other(action)) => debug!("Ignoring wal2json action '{action}'"),
            Err(e @ SyncError::Data(_)) => {
                warn!("Dropping malformed change at {}: {e}", message.lsn);
                batch.dropped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if !pending.is_empty() {
        debug!(
            "{} changes of an uncommitted transaction left for the next peek",
            pending.len()
        );
    }

    Ok(batch)
}
