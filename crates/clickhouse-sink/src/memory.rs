//! In-process warehouse with the same merge semantics as the ClickHouse
//! tables: per key, the highest version wins (the later write on a tie)
//! and tombstoned keys are not observable.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use sync_core::path::scalar_to_string;
use sync_core::{Record, Result, SyncError, WriteBatch, WriteRow};

use crate::Warehouse;

#[derive(Debug, Default)]
struct MemoryTable {
    key_columns: Vec<String>,
    rows: BTreeMap<String, WriteRow>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, MemoryTable>>,
    statements: Mutex<Vec<String>>,
    merges: Mutex<usize>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observable rows of `table`, ordered by key.
    pub fn visible_rows(&self, table: &str) -> Vec<Record> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables
            .get(table)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| !r.deleted)
                    .map(|r| r.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Statements passed to [`Warehouse::execute`], in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of non-empty batches merged so far.
    pub fn merge_count(&self) -> usize {
        *self.merges.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key_of(key_columns: &[String], record: &Record) -> String {
    let values: Vec<&Value> = key_columns
        .iter()
        .map(|c| record.get(c).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => scalar_to_string(a).cmp(&scalar_to_string(b)),
    }
}

#[async_trait::async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables.contains_key(table))
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let t = tables
            .get(table)
            .ok_or_else(|| SyncError::config(format!("Table '{table}' does not exist")))?;

        let visible: Vec<&WriteRow> = t.rows.values().filter(|r| !r.deleted).collect();
        if !visible.is_empty() && !visible.iter().any(|r| r.record.contains_key(column)) {
            return Err(SyncError::config(format!(
                "Column '{column}' does not exist in table '{table}'"
            )));
        }

        Ok(visible
            .iter()
            .filter_map(|r| r.record.get(column))
            .filter(|v| !v.is_null())
            .max_by(|a, b| compare_values(a, b))
            .and_then(scalar_to_string))
    }

    async fn merge(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let table = tables
            .entry(batch.table.clone())
            .or_insert_with(|| MemoryTable {
                key_columns: batch.key_columns.clone(),
                rows: BTreeMap::new(),
            });

        for row in &batch.rows {
            let key = key_of(&table.key_columns, &row.record);
            match table.rows.get(&key) {
                Some(existing) if existing.version > row.version => {}
                _ => {
                    table.rows.insert(key, row.clone());
                }
            }
        }
        *self.merges.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn retire_older_than(&self, table: &str, version: u64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = tables.get_mut(table) {
            for row in t.rows.values_mut().filter(|r| !r.deleted && r.version < version) {
                row.deleted = true;
                row.version = version;
            }
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql.to_string());
        Ok(())
    }
}
