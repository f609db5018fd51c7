//! Row, change and write-batch types shared between sources and sinks.

use crate::Lsn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A row keyed by column name.
///
/// Sources convert native values into JSON values up front, so everything
/// downstream (transformer, destination) works with a single representation.
pub type Record = serde_json::Map<String, Value>;

/// Row-level change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A decoded row-level change.
///
/// `row` holds the post-image for inserts and updates, and only the
/// replica-identity columns for deletes. `lsn` is the commit LSN of the
/// transaction that produced the change (or the slot's consistent point for
/// snapshot rows), which makes it usable as a merge version.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    pub operation: Operation,
    pub key_columns: Vec<String>,
    pub row: Record,
    pub lsn: Lsn,
}

impl ChangeEvent {
    /// Values of the key columns, in key order. Missing columns are `Null`.
    pub fn key(&self) -> Vec<Value> {
        self.key_columns
            .iter()
            .map(|c| self.row.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// One row bound for a destination merge.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    pub record: Record,
    /// Competing writes for the same key resolve to the highest version.
    pub version: u64,
    /// Tombstone: the key must stop being observable.
    pub deleted: bool,
}

impl WriteRow {
    pub fn upsert(record: Record, version: u64) -> Self {
        Self {
            record,
            version,
            deleted: false,
        }
    }

    pub fn tombstone(record: Record, version: u64) -> Self {
        Self {
            record,
            version,
            deleted: true,
        }
    }
}

/// A batch of rows merged into one destination table, keyed by `key_columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub table: String,
    pub key_columns: Vec<String>,
    pub rows: Vec<WriteRow>,
}

impl WriteBatch {
    pub fn new(table: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            key_columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: WriteRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
