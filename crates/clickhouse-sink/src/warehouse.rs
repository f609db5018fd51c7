//! ClickHouse implementation of [`Warehouse`].
//!
//! Rows have a schema only known at runtime, so batches are sent as
//! `JSONEachRow` over the HTTP interface instead of typed `RowBinary`
//! inserts. Table layouts are discovered from `system.columns` once and
//! cached; new columns are added on the fly.

use clickhouse::Client;
use serde::Deserialize;
use std::collections::HashMap;
use sync_core::{Result, SyncError, WriteBatch};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::schema::{
    add_column_sql, create_table_sql, encode_rows, infer_columns, max_value_sql, qualified_name,
    retire_sql, Column, ColumnType,
};
use crate::Warehouse;

/// Connection settings for a ClickHouse destination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP endpoint, e.g. `http://localhost:8123`
    pub url: String,
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_username() -> String {
    "default".to_string()
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct SystemColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, clickhouse::Row, Deserialize)]
struct MaxRow {
    rows: u64,
    value: String,
}

impl MaxRow {
    /// `None` when no observable row has a value in the column.
    fn into_watermark(self) -> Option<String> {
        (self.rows > 0).then_some(self.value)
    }
}

/// Classify a `clickhouse::error::Error` into a [`SyncError`].
pub fn classify_clickhouse_error(err: clickhouse::error::Error, context: &str) -> SyncError {
    let lower = err.to_string().to_lowercase();
    let transient = lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("broken pipe")
        || lower.contains("reset by peer")
        || lower.contains("service_unavailable");

    if transient {
        SyncError::Connection {
            context: context.to_string(),
            source: Box::new(err),
        }
    } else {
        SyncError::Destination {
            context: context.to_string(),
            source: Box::new(err),
        }
    }
}

pub struct ClickHouseWarehouse {
    client: Client,
    database: String,
    columns: Mutex<HashMap<String, Vec<Column>>>,
}

impl ClickHouseWarehouse {
    pub fn new(config: &ClickHouseConfig) -> Self {
        // No default database: every statement is qualified, and preflight
        // has to run before the database is known to exist.
        let mut client = Client::default()
            .with_url(&config.url)
            .with_user(&config.username);
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }
        Self {
            client,
            database: config.database.clone(),
            columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    async fn load_columns(&self, table: &str) -> Result<Vec<Column>> {
        let rows = self
            .client
            .query("SELECT name, type FROM system.columns WHERE database = ? AND table = ? ORDER BY position")
            .bind(&self.database)
            .bind(table)
            .fetch_all::<SystemColumn>()
            .await
            .map_err(|e| classify_clickhouse_error(e, &format!("Failed to read columns of {table}")))?;

        Ok(rows
            .into_iter()
            .map(|c| Column::new(c.name, ColumnType::from_clickhouse(&c.column_type)))
            .collect())
    }

    async fn run(&self, sql: &str, context: &str) -> Result<()> {
        self.client
            .query(sql)
            .execute()
            .await
            .map_err(|e| classify_clickhouse_error(e, context))
    }

    /// Make sure `batch.table` exists and has every column of the batch.
    /// Returns the table's data columns.
    async fn prepare_table(&self, batch: &WriteBatch) -> Result<Vec<Column>> {
        let mut cache = self.columns.lock().await;
        let inferred = infer_columns(&batch.rows);

        if !cache.contains_key(&batch.table) {
            let mut columns = self.load_columns(&batch.table).await?;
            if columns.is_empty() {
                let sql = create_table_sql(&self.database, &batch.table, &batch.key_columns, &inferred);
                self.run(&sql, &format!("Failed to create table {}", batch.table))
                    .await?;
                info!("Created table {}", qualified_name(&self.database, &batch.table));
                columns = inferred.clone();
                for key in &batch.key_columns {
                    if !columns.iter().any(|c| &c.name == key) {
                        columns.push(Column::new(key.clone(), ColumnType::String));
                    }
                }
            }
            cache.insert(batch.table.clone(), columns);
        }
        let known = cache.entry(batch.table.clone()).or_default();

        for column in inferred {
            if known.iter().any(|c| c.name == column.name) {
                continue;
            }
            let sql = add_column_sql(&self.database, &batch.table, &column);
            self.run(&sql, &format!("Failed to add column {}", column.name))
                .await?;
            info!("Added column {} to {}", column.name, batch.table);
            known.push(column);
        }

        Ok(known
            .iter()
            .filter(|c| !c.name.starts_with("_sync_"))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl Warehouse for ClickHouseWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let count = self
            .client
            .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
            .bind(&self.database)
            .bind(table)
            .fetch_one::<u64>()
            .await
            .map_err(|e| classify_clickhouse_error(e, &format!("Failed to look up table {table}")))?;
        Ok(count > 0)
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>> {
        let row = self
            .client
            .query(&max_value_sql(&self.database, table, column))
            .fetch_one::<MaxRow>()
            .await
            .map_err(|e| classify_clickhouse_error(e, &format!("Failed to read max({column}) of {table}")))?;
        Ok(row.into_watermark())
    }

    async fn merge(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let columns = self.prepare_table(batch).await?;

        let sql = format!(
            "INSERT INTO {} FORMAT JSONEachRow\n{}",
            qualified_name(&self.database, &batch.table),
            encode_rows(batch, &columns)
        );
        self.run(&sql, &format!("Failed to merge into {}", batch.table))
            .await?;
        debug!("Merged {} rows into {}", batch.len(), batch.table);
        Ok(())
    }

    async fn retire_older_than(&self, table: &str, version: u64) -> Result<()> {
        self.run(
            &retire_sql(&self.database, table, version),
            &format!("Failed to retire stale rows of {table}"),
        )
        .await?;
        info!("Retired rows of {table} older than version {version}");
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.run(sql, "Failed to execute statement").await
    }
}
