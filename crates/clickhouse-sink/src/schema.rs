//! Destination table layout: type inference, DDL and row encoding.
//!
//! Every table is a `ReplacingMergeTree` versioned by `_sync_version` with
//! `_sync_deleted` as the tombstone flag, ordered by the merge key. Reads
//! that need merged results use `FINAL` and skip tombstones.

use serde_json::{Map, Value};
use std::collections::HashMap;
use sync_core::{WriteBatch, WriteRow};

pub const VERSION_COLUMN: &str = "_sync_version";
pub const DELETED_COLUMN: &str = "_sync_deleted";

/// Column types the warehouse tables are created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Float64,
    Bool,
    String,
}

impl ColumnType {
    /// Type of a single JSON value; `None` for null.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Int64),
            Value::Number(_) => Some(ColumnType::Float64),
            // Nested values are stored as JSON text
            Value::String(_) | Value::Object(_) | Value::Array(_) => Some(ColumnType::String),
        }
    }

    /// Smallest type holding values of both `self` and `other`.
    pub fn widen(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => String,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Int64 => "Int64",
            ColumnType::Float64 => "Float64",
            ColumnType::Bool => "Bool",
            ColumnType::String => "String",
        }
    }

    /// Map a type reported by `system.columns`. Anything not created by
    /// this crate is treated as text.
    pub fn from_clickhouse(type_name: &str) -> Self {
        let inner = type_name
            .strip_prefix("Nullable(")
            .and_then(|t| t.strip_suffix(')'))
            .unwrap_or(type_name);
        match inner {
            "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
                ColumnType::Int64
            }
            "Float32" | "Float64" => ColumnType::Float64,
            "Bool" => ColumnType::Bool,
            _ => ColumnType::String,
        }
    }

    /// Convert `value` to something a column of this type accepts.
    /// Values that cannot be represented become null.
    pub fn coerce(self, value: &Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnType::String, Value::String(_)) => value.clone(),
            (ColumnType::String, other) => Value::String(other.to_string()),
            (ColumnType::Int64, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from)
                .unwrap_or(Value::Null),
            (ColumnType::Int64, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null)
            }
            (ColumnType::Float64, Value::Number(n)) => {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
            (ColumnType::Float64, Value::String(s)) => {
                s.trim().parse::<f64>().map(Value::from).unwrap_or(Value::Null)
            }
            (ColumnType::Bool, Value::Bool(_)) => value.clone(),
            (ColumnType::Bool, Value::String(s)) => match s.as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Columns of a batch in first-seen order, with types widened across rows.
/// Columns that are null in every row are text.
pub fn infer_columns(rows: &[WriteRow]) -> Vec<Column> {
    let mut order: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut inferred: Vec<Option<ColumnType>> = Vec::new();

    for row in rows {
        for (name, value) in &row.record {
            let index = match positions.get(name) {
                Some(&i) => i,
                None => {
                    positions.insert(name.clone(), order.len());
                    order.push(name.clone());
                    inferred.push(None);
                    order.len() - 1
                }
            };
            if let Some(t) = ColumnType::infer(value) {
                inferred[index] = Some(match inferred[index] {
                    Some(current) => current.widen(t),
                    None => t,
                });
            }
        }
    }

    order
        .into_iter()
        .zip(inferred)
        .filter(|(name, _)| name != VERSION_COLUMN && name != DELETED_COLUMN)
        .map(|(name, t)| Column::new(name, t.unwrap_or(ColumnType::String)))
        .collect()
}

/// Quote an identifier with backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

pub fn qualified_name(database: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(database), quote_identifier(table))
}

/// `CREATE TABLE` for a merge table. Key columns are non-nullable and are
/// added as text if the batch does not carry them.
pub fn create_table_sql(
    database: &str,
    table: &str,
    key_columns: &[String],
    columns: &[Column],
) -> String {
    let mut defs = Vec::with_capacity(columns.len() + key_columns.len() + 2);
    for key in key_columns {
        let t = columns
            .iter()
            .find(|c| &c.name == key)
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::String);
        defs.push(format!("{} {}", quote_identifier(key), t.sql()));
    }
    for column in columns.iter().filter(|c| !key_columns.contains(&c.name)) {
        defs.push(format!(
            "{} Nullable({})",
            quote_identifier(&column.name),
            column.column_type.sql()
        ));
    }
    defs.push(format!("{VERSION_COLUMN} UInt64"));
    defs.push(format!("{DELETED_COLUMN} UInt8"));

    let order_by = key_columns
        .iter()
        .map(|k| quote_identifier(k))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = ReplacingMergeTree({VERSION_COLUMN}, {DELETED_COLUMN}) ORDER BY ({order_by})",
        qualified_name(database, table),
        defs.join(", ")
    )
}

pub fn add_column_sql(database: &str, table: &str, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} Nullable({})",
        qualified_name(database, table),
        quote_identifier(&column.name),
        column.column_type.sql()
    )
}

/// Maximum of `column` over the observable rows, as text. Null values are
/// skipped, so `rows` is zero when no row carries a value.
pub fn max_value_sql(database: &str, table: &str, column: &str) -> String {
    let column = quote_identifier(column);
    format!(
        "SELECT count() AS rows, ifNull(toString(max({column})), '') AS value FROM {} FINAL \
         WHERE {DELETED_COLUMN} = 0 AND {column} IS NOT NULL",
        qualified_name(database, table)
    )
}

/// Tombstone, at `version`, every observable row last written below
/// `version`.
pub fn retire_sql(database: &str, table: &str, version: u64) -> String {
    let table = qualified_name(database, table);
    format!(
        "INSERT INTO {table} SELECT * REPLACE ({version} AS {VERSION_COLUMN}, 1 AS {DELETED_COLUMN}) \
         FROM {table} FINAL WHERE {DELETED_COLUMN} = 0 AND {VERSION_COLUMN} < {version}"
    )
}

/// Encode a batch as `JSONEachRow` lines for the given table columns.
/// Columns missing from a row are written as null.
pub fn encode_rows(batch: &WriteBatch, columns: &[Column]) -> String {
    let mut out = String::new();
    for row in &batch.rows {
        let mut line = Map::new();
        for column in columns {
            let value = row.record.get(&column.name).unwrap_or(&Value::Null);
            line.insert(column.name.clone(), column.column_type.coerce(value));
        }
        line.insert(VERSION_COLUMN.to_string(), Value::from(row.version));
        line.insert(DELETED_COLUMN.to_string(), Value::from(u8::from(row.deleted)));
        out.push_str(&Value::Object(line).to_string());
        out.push('\n');
    }
    // The client treats `?` as a bind placeholder
    out.replace('?', "\\u003f")
}
