//! The flat ad record both payload layouts are normalized into.

use serde::Serialize;
use serde_json::Value;
use sync_core::path::{lookup_f64, lookup_i64, lookup_str, scalar_to_string};
use sync_core::{path, Record};

/// Payload layout a record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    /// `data.OS`, `data.params`, `data.response.inlineItems`
    Legacy,
    /// `data.kwargs.{params, inlineItems, os, country}`
    Current,
}

impl SchemaVersion {
    pub fn as_f64(self) -> f64 {
        match self {
            SchemaVersion::Legacy => 1.0,
            SchemaVersion::Current => 2.0,
        }
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

/// Search context an ad was shown for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trip {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatAdRecord {
    /// `{row id}-{rank}`
    pub id: String,
    pub user_id: Option<i64>,
    pub rank: Option<i64>,
    pub site: Option<String>,
    pub headline: Option<String>,
    pub product_type: Option<String>,
    pub description: Option<String>,
    pub booking_button_text: Option<String>,
    pub cpc: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub os: Option<String>,
    pub country: Option<String>,
    pub created_at: Option<String>,
    pub version: SchemaVersion,
}

impl FlatAdRecord {
    pub fn into_record(self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

/// Fields shared by every ad of one log row.
pub(crate) struct RowContext<'a> {
    pub row_id: String,
    pub user_id: Option<i64>,
    pub created_at: Option<String>,
    pub os: Option<String>,
    pub country: Option<String>,
    pub trip: Trip,
    pub version: SchemaVersion,
    pub items: &'a [Value],
}

impl RowContext<'_> {
    /// One record per inline item. Items without a rank are numbered by
    /// position so ids stay unique within the row.
    pub fn expand(&self) -> Vec<FlatAdRecord> {
        self.items
            .iter()
            .enumerate()
            .map(|(position, ad)| {
                let rank = lookup_i64(ad, path!["rank"]);
                let suffix = lookup(ad, "rank").unwrap_or_else(|| (position + 1).to_string());
                FlatAdRecord {
                    id: format!("{}-{suffix}", self.row_id),
                    user_id: self.user_id,
                    rank,
                    site: lookup(ad, "site"),
                    headline: lookup(ad, "headline"),
                    product_type: lookup(ad, "productType"),
                    description: lookup(ad, "description"),
                    booking_button_text: lookup(ad, "bookingButtonText"),
                    cpc: lookup_f64(ad, path!["cpcEstimate"]),
                    start_date: self.trip.start_date.clone(),
                    end_date: self.trip.end_date.clone(),
                    origin: self.trip.origin.clone(),
                    destination: self.trip.destination.clone(),
                    os: self.os.clone(),
                    country: self.country.clone(),
                    created_at: self.created_at.clone(),
                    version: self.version,
                }
            })
            .collect()
    }
}

fn lookup(ad: &Value, key: &str) -> Option<String> {
    lookup_str(ad, path![key])
}

/// `id`, `related_user_id` and `created_at` of a log row.
pub(crate) fn row_identity(row: &Record) -> Option<(String, Option<i64>, Option<String>)> {
    let row_id = row.get("id").and_then(scalar_to_string)?;
    let user_id = row.get("related_user_id").and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    let created_at = row.get("created_at").and_then(scalar_to_string);
    Some((row_id, user_id, created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_record_spells_version_as_number() {
        let record = FlatAdRecord {
            id: "7-1".into(),
            user_id: Some(3),
            rank: Some(1),
            site: None,
            headline: None,
            product_type: None,
            description: None,
            booking_button_text: None,
            cpc: Some(0.42),
            start_date: None,
            end_date: None,
            origin: None,
            destination: None,
            os: None,
            country: None,
            created_at: None,
            version: SchemaVersion::Legacy,
        }
        .into_record();

        assert_eq!(record["id"], json!("7-1"));
        assert_eq!(record["version"], json!(1.0));
        assert_eq!(record["cpc"], json!(0.42));
        assert_eq!(record["site"], Value::Null);
    }

    #[test]
    fn test_items_without_rank_are_numbered_by_position() {
        let items = vec![json!({"site": "a"}), json!({"rank": 9, "site": "b"})];
        let context = RowContext {
            row_id: "11".into(),
            user_id: None,
            created_at: None,
            os: None,
            country: None,
            trip: Trip::default(),
            version: SchemaVersion::Current,
            items: &items,
        };
        let ids: Vec<String> = context.expand().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["11-1", "11-9"]);
    }
}
