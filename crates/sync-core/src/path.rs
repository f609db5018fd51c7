//! Safe nested lookups over semi-structured JSON payloads.
//!
//! Payloads decoded from log tables are only loosely shaped: any level may be
//! missing, `null`, or of an unexpected type. Lookups therefore never fail;
//! they resolve to `None` and let callers fall back to a default.
//!
//! ```rust
//! use serde_json::json;
//! use sync_core::{path, path::lookup_str};
//!
//! let payload = json!({"kwargs": {"params": {"legs": [{"date": "2024-03-01"}]}}});
//! assert_eq!(
//!     lookup_str(&payload, path!["kwargs", "params", "legs", 0, "date"]),
//!     Some("2024-03-01".to_string())
//! );
//! assert_eq!(lookup_str(&payload, path!["kwargs", "missing"]), None);
//! ```

use serde_json::Value;

/// One step of a lookup path: an object key or an array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for PathSegment<'a> {
    fn from(key: &'a str) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment<'_> {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Build a `&[PathSegment]` from string keys and integer indices.
#[macro_export]
macro_rules! path {
    ($($segment:expr),* $(,)?) => {
        &[$($crate::path::PathSegment::from($segment)),*]
    };
}

/// Walk `path` from `value`. A present-but-null leaf is returned as
/// `Some(Value::Null)` so callers can tell it apart from a missing key.
pub fn lookup<'v>(value: &'v Value, path: &[PathSegment<'_>]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match segment {
        PathSegment::Key(key) => current.as_object()?.get(*key),
        PathSegment::Index(index) => current.as_array()?.get(*index),
    })
}

/// Look up a scalar and render it as a string. Numbers and booleans are
/// rendered with their JSON spelling; `null`, objects and arrays give `None`.
pub fn lookup_str(value: &Value, path: &[PathSegment<'_>]) -> Option<String> {
    lookup(value, path).and_then(scalar_to_string)
}

/// Look up a number, accepting numeric strings as well.
pub fn lookup_f64(value: &Value, path: &[PathSegment<'_>]) -> Option<f64> {
    match lookup(value, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Look up an integer, accepting integral floats and numeric strings.
pub fn lookup_i64(value: &Value, path: &[PathSegment<'_>]) -> Option<i64> {
    match lookup(value, path)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Look up an array, treating anything else as empty.
pub fn lookup_array<'v>(value: &'v Value, path: &[PathSegment<'_>]) -> &'v [Value] {
    lookup(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}
