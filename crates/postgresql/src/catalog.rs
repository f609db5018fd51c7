//! Catalog lookups: primary keys and column types.

use sync_core::{Result, SyncError};
use tokio_postgres::Client;

use crate::classify_pg_error;

/// Get primary key columns for a table, in key order.
///
/// Returns an empty list for tables without a primary key.
pub async fn primary_key_columns(client: &Client, schema: &str, table: &str) -> Result<Vec<String>> {
    let query = "
        SELECT a.attname::text AS column_name
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
        WHERE i.indrelid = format('%I.%I', $1::text, $2::text)::regclass
        AND i.indisprimary
        ORDER BY array_position(i.indkey, a.attnum)
    ";

    let rows = client
        .query(query, &[&schema, &table])
        .await
        .map_err(|e| classify_pg_error(e, &format!("Failed to read primary key of {schema}.{table}")))?;

    Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
}

/// The SQL spelling of a column's type (e.g. `timestamp with time zone`),
/// suitable for casting a text parameter to it.
pub async fn column_type(client: &Client, schema: &str, table: &str, column: &str) -> Result<String> {
    let query = "
        SELECT format_type(a.atttypid, a.atttypmod)
        FROM pg_attribute a
        WHERE a.attrelid = format('%I.%I', $1::text, $2::text)::regclass
        AND a.attname = $3
        AND a.attnum > 0
        AND NOT a.attisdropped
    ";

    let row = client
        .query_opt(query, &[&schema, &table, &column])
        .await
        .map_err(|e| classify_pg_error(e, &format!("Failed to read columns of {schema}.{table}")))?;

    match row {
        Some(row) => Ok(row.get::<_, String>(0)),
        None => Err(SyncError::config(format!(
            "Column '{column}' not found in table {schema}.{table}"
        ))),
    }
}

/// Pick the merge key for a table: its primary key, or `id` when it has none.
pub fn merge_key_or_id(primary_key: Vec<String>) -> Vec<String> {
    if primary_key.is_empty() {
        vec!["id".to_string()]
    } else {
        primary_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_key_falls_back_to_id() {
        assert_eq!(merge_key_or_id(vec![]), vec!["id".to_string()]);
        assert_eq!(
            merge_key_or_id(vec!["tenant".into(), "order_no".into()]),
            vec!["tenant".to_string(), "order_no".to_string()]
        );
    }
}
