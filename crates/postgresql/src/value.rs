//! PostgreSQL → JSON value conversion.
//!
//! Rows arrive through two paths: binary rows from `tokio_postgres` (batched
//! reads and snapshots) and text-typed values decoded by wal2json (streaming).
//! Both paths must produce the same JSON for the same stored value, otherwise
//! a snapshot row and a streamed update of it would disagree on shape:
//!
//! | PostgreSQL | JSON |
//! |------------|------|
//! | integers | number |
//! | real / double precision | number (`null` for NaN/Infinity) |
//! | numeric | string, trailing zeros trimmed |
//! | timestamp / timestamptz | RFC 3339 UTC string with microseconds |
//! | date, time, interval | string as printed by PostgreSQL |
//! | json / jsonb | the JSON document |
//! | bytea | base64 string |
//! | arrays | JSON array |
//!
//! Fixed-width timestamps keep lexicographic order equal to chronological
//! order, which the watermark relies on.

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use sync_core::{Record, Result, SyncError};
use tokio_postgres::types::Type;
use tokio_postgres::Row;

/// Convert every column of a row into a [`Record`].
pub fn row_to_record(row: &Row) -> Result<Record> {
    let mut record = Record::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = convert_postgres_value(row, i)?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn decimal_string(d: Decimal) -> String {
    d.normalize().to_string()
}

fn get<'a, T>(row: &'a Row, index: usize) -> Result<Option<T>>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(index).map_err(|e| {
        SyncError::data(format!(
            "Failed to read column '{}': {e}",
            row.columns()[index].name()
        ))
    })
}

fn array<T>(items: Option<Vec<T>>, f: impl Fn(T) -> Value) -> Value {
    match items {
        Some(items) => Value::Array(items.into_iter().map(f).collect()),
        None => Value::Null,
    }
}

/// Convert a binary PostgreSQL value to JSON.
pub fn convert_postgres_value(row: &Row, index: usize) -> Result<Value> {
    let column = &row.columns()[index];
    let pg_type = column.type_();

    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, index)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, index)?.map(|i| Value::from(i as i64)),
        Type::INT4 => get::<i32>(row, index)?.map(|i| Value::from(i as i64)),
        Type::INT8 => get::<i64>(row, index)?.map(Value::from),
        Type::OID => get::<u32>(row, index)?.map(|i| Value::from(i as u64)),
        Type::FLOAT4 => get::<f32>(row, index)?.map(|f| float(f as f64)),
        Type::FLOAT8 => get::<f64>(row, index)?.map(float),
        Type::NUMERIC => get::<Decimal>(row, index)?.map(|d| Value::String(decimal_string(d))),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            get::<String>(row, index)?.map(Value::String)
        }
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index)?
            .map(|ts| Value::String(format_timestamp(ts.and_utc()))),
        Type::TIMESTAMPTZ => {
            get::<DateTime<Utc>>(row, index)?.map(|dt| Value::String(format_timestamp(dt)))
        }
        Type::DATE => get::<NaiveDate>(row, index)?.map(|d| Value::String(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, index)?.map(|t| Value::String(t.to_string())),
        Type::JSON | Type::JSONB => get::<Value>(row, index)?,
        Type::UUID => get::<uuid::Uuid>(row, index)?.map(|u| Value::String(u.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, index)?.map(|bytes| {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            Some(array(get::<Vec<String>>(row, index)?, Value::String))
        }
        Type::INT2_ARRAY => Some(array(get::<Vec<i16>>(row, index)?, |v| Value::from(v as i64))),
        Type::INT4_ARRAY => Some(array(get::<Vec<i32>>(row, index)?, |v| Value::from(v as i64))),
        Type::INT8_ARRAY => Some(array(get::<Vec<i64>>(row, index)?, Value::from)),
        Type::FLOAT8_ARRAY => Some(array(get::<Vec<f64>>(row, index)?, float)),
        Type::BOOL_ARRAY => Some(array(get::<Vec<bool>>(row, index)?, Value::Bool)),
        _ => {
            // For unknown types, try to get as string
            match row.try_get::<_, Option<String>>(index) {
                Ok(v) => v.map(Value::String),
                Err(_) => {
                    return Err(SyncError::data(format!(
                        "Unsupported PostgreSQL type {pg_type} in column '{}'",
                        column.name()
                    )))
                }
            }
        }
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Strip type modifiers: `character varying(255)` → `character varying`,
/// `timestamp(3) with time zone` → `timestamp with time zone`.
pub fn base_type_name(pg_type: &str) -> String {
    let mut out = String::with_capacity(pg_type.len());
    let mut depth = 0usize;
    for c in pg_type.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert a value as emitted by wal2json, given the column's type name.
pub fn convert_text_value(value: Option<&Value>, pg_type: &str) -> Result<Value> {
    let value = match value {
        Some(v) if !v.is_null() => v,
        _ => return Ok(Value::Null),
    };
    let base = base_type_name(pg_type);
    let type_error = || SyncError::data(format!("Unexpected {base} value from wal2json: {value}"));

    let converted = match base.as_str() {
        "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "oid" => {
            match value {
                Value::Number(_) => value.clone(),
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| type_error())?,
                _ => return Err(type_error()),
            }
        }
        "real" | "float4" | "double precision" | "float8" => match value {
            Value::Number(n) => n.as_f64().map(float).ok_or_else(type_error)?,
            // NaN and Infinity arrive as strings
            Value::String(s) => s.trim().parse::<f64>().map(float).unwrap_or(Value::Null),
            _ => return Err(type_error()),
        },
        "numeric" | "decimal" => match value {
            Value::Number(n) => {
                let s = n.to_string();
                match s.parse::<Decimal>() {
                    Ok(d) => Value::String(decimal_string(d)),
                    Err(_) => Value::String(s),
                }
            }
            Value::String(s) => Value::String(s.clone()),
            _ => return Err(type_error()),
        },
        "boolean" | "bool" => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => Value::Bool(matches!(s.as_str(), "t" | "true")),
            _ => return Err(type_error()),
        },
        "timestamp" | "timestamp without time zone" => {
            let s = value.as_str().ok_or_else(type_error)?;
            Value::String(format_timestamp(parse_timestamp(s)?))
        }
        "timestamptz" | "timestamp with time zone" => {
            let s = value.as_str().ok_or_else(type_error)?;
            Value::String(format_timestamp(parse_timestamptz(s)?))
        }
        "json" | "jsonb" => match value {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| SyncError::data(format!("Failed to parse {base} value: {e}")))?,
            other => other.clone(),
        },
        "bytea" => {
            let s = value.as_str().ok_or_else(type_error)?;
            let hex_str = s.strip_prefix("\\x").unwrap_or(s);
            let bytes = hex::decode(hex_str)
                .map_err(|e| SyncError::data(format!("Failed to decode bytea hex string: {e}")))?;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        s if s.ends_with("[]") => match value {
            Value::String(text) => parse_postgres_array(text, s.trim_end_matches("[]"))?,
            Value::Array(_) => value.clone(),
            _ => return Err(type_error()),
        },
        // text, varchar, char, uuid, date, time, interval, enums, ...
        _ => match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        },
    };

    Ok(converted)
}

/// Parses PostgreSQL array format like "{1,2,3}" or "{apple,"b,c",NULL}"
fn parse_postgres_array(text: &str, element_type: &str) -> Result<Value> {
    let inner = text
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| SyncError::data(format!("Invalid array literal: {text}")))?;

    let mut elements = Vec::new();
    if inner.is_empty() {
        return Ok(Value::Array(elements));
    }

    let mut current = String::new();
    let mut quoted = false;
    let mut was_quoted = false;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                was_quoted = true;
            }
            ',' if !quoted => {
                elements.push(array_element(&current, was_quoted, element_type)?);
                current.clear();
                was_quoted = false;
            }
            _ => current.push(c),
        }
    }
    elements.push(array_element(&current, was_quoted, element_type)?);

    Ok(Value::Array(elements))
}

fn array_element(raw: &str, was_quoted: bool, element_type: &str) -> Result<Value> {
    if !was_quoted && raw == "NULL" {
        return Ok(Value::Null);
    }
    convert_text_value(Some(&Value::String(raw.to_string())), element_type)
}

/// Parses PostgreSQL TIMESTAMP (without timezone), taken to be UTC.
///
/// Supports:
/// - ISO 8601: "2024-01-15T10:30:00Z"
/// - PostgreSQL wal2json: "2024-01-15 10:30:00", "1997-12-17 15:37:16.123456"
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    for format in formats {
        if let Ok(naive_dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive_dt.and_utc());
        }
    }

    Err(SyncError::data(format!("Unable to parse timestamp: {s}")))
}

/// Parses PostgreSQL TIMESTAMPTZ to UTC.
///
/// Supports:
/// - ISO 8601: "2024-01-15T10:30:00+00:00", "1997-12-17T15:37:16Z"
/// - PostgreSQL wal2json: "2024-01-15 10:30:00+00", "2024-01-15 10:30:00.5-08"
pub fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }

    // Normalize short timezone offset like +00 or -08 to +00:00 or -08:00
    let normalized = if s.len() > 3 {
        let tz_start = s.len() - 3;
        match &s[tz_start..tz_start + 1] {
            "+" | "-" => format!("{s}:00"),
            _ => s.to_string(),
        }
    } else {
        s.to_string()
    };

    let formats = [
        "%Y-%m-%d %H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%z",
    ];

    for format in formats {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    Err(SyncError::data(format!("Unable to parse timestamptz: {s}")))
}
