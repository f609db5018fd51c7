//! Inline-ad row transformer.
//!
//! Log rows carry a `name` discriminator and a nested `data` payload whose
//! shape depends on it. [`transform`] classifies a row and flattens each of
//! its inline ads into a [`FlatAdRecord`]; one row yields zero or more
//! records. Transformation never fails: missing or oddly typed fields become
//! nulls, and rows of an unknown kind are logged and dropped.

mod current;
mod legacy;
mod record;

use serde_json::Value;
use sync_core::Record;
use tracing::warn;

pub use record::{FlatAdRecord, SchemaVersion, Trip};

use record::{row_identity, RowContext};

/// Merge key of flattened ad tables.
pub const AD_KEY_COLUMN: &str = "id";

/// Ad kinds, matched on the suffix of the row's `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdKind {
    Car,
    Flight,
    Hotel,
    LegacyAdFetch,
    Unrecognized(String),
}

impl AdKind {
    pub fn classify(name: &str) -> Self {
        if name.ends_with("car") {
            AdKind::Car
        } else if name.ends_with("flight") {
            AdKind::Flight
        } else if name.ends_with("hotel") {
            AdKind::Hotel
        } else if name.ends_with("ad_fetch") {
            AdKind::LegacyAdFetch
        } else {
            AdKind::Unrecognized(name.to_string())
        }
    }
}

/// Flatten a log row, dispatching on its `name`.
pub fn transform(row: &Record) -> Vec<FlatAdRecord> {
    let name = row.get("name").and_then(Value::as_str).unwrap_or_default();
    transform_as(AdKind::classify(name), row)
}

/// Flatten a log row that is known to use the legacy layout.
pub fn transform_legacy(row: &Record) -> Vec<FlatAdRecord> {
    transform_as(AdKind::LegacyAdFetch, row)
}

fn transform_as(kind: AdKind, row: &Record) -> Vec<FlatAdRecord> {
    if let AdKind::Unrecognized(name) = &kind {
        warn!("Unknown ad type: {name}");
        return Vec::new();
    }
    let Some((row_id, user_id, created_at)) = row_identity(row) else {
        warn!("Skipping {kind:?} row without an id");
        return Vec::new();
    };

    let data = payload(row);
    let context = match kind {
        AdKind::LegacyAdFetch => {
            let legacy = legacy::payload(&data);
            RowContext {
                row_id,
                user_id,
                created_at,
                os: legacy.os,
                country: legacy.country,
                trip: legacy.trip,
                version: SchemaVersion::Legacy,
                items: legacy.items,
            }
        }
        AdKind::Car | AdKind::Flight | AdKind::Hotel => {
            let kwargs = current::kwargs(&data);
            let trip = match kind {
                AdKind::Car => current::car_trip(kwargs.params),
                AdKind::Flight => current::flight_trip(kwargs.params),
                _ => current::hotel_trip(kwargs.params),
            };
            RowContext {
                row_id,
                user_id,
                created_at,
                os: kwargs.os,
                country: kwargs.country,
                trip,
                version: SchemaVersion::Current,
                items: kwargs.items,
            }
        }
        AdKind::Unrecognized(_) => return Vec::new(),
    };
    context.expand()
}

/// The row's `data` column. `json` columns may arrive as text.
fn payload(row: &Record) -> Value {
    match row.get("data") {
        Some(Value::String(text)) => serde_json::from_str(text).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    }
}
