//! Run history kept in the destination itself.
//!
//! Storing checkpoints next to the data means that dropping the destination
//! database also forgets that a snapshot was taken, so the next run takes a
//! fresh one instead of streaming into empty tables.

use anyhow::{Context, Result};
use async_trait::async_trait;
use checkpoint::{CheckpointID, CheckpointStore, StoredCheckpoint};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::schema::qualified_name;
use crate::ClickHouseWarehouse;

const STATE_TABLE: &str = "_sync_state";

#[derive(Debug, clickhouse::Row, Deserialize)]
struct StateRow {
    checkpoint_data: String,
    created_at: String,
}

pub struct ClickHouseCheckpointStore {
    warehouse: std::sync::Arc<ClickHouseWarehouse>,
    table: String,
    created: OnceCell<()>,
}

impl ClickHouseCheckpointStore {
    pub fn new(warehouse: std::sync::Arc<ClickHouseWarehouse>) -> Self {
        let table = qualified_name(warehouse.database(), STATE_TABLE);
        Self {
            warehouse,
            table,
            created: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.created
            .get_or_try_init(|| async {
                let sql = format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     scope String, database_type String, phase String, \
                     checkpoint_data String, created_at String, version UInt64) \
                     ENGINE = ReplacingMergeTree(version) ORDER BY (scope, database_type, phase)",
                    self.table
                );
                self.warehouse
                    .client()
                    .query(&sql)
                    .execute()
                    .await
                    .context("Failed to create run-history table")
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for ClickHouseCheckpointStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        self.ensure_table().await?;
        let stored = StoredCheckpoint::new(id, checkpoint_data);
        let version = stored.created_at.timestamp_micros().max(0) as u64;

        self.warehouse
            .client()
            .query(&format!(
                "INSERT INTO {} (scope, database_type, phase, checkpoint_data, created_at, version) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                self.table
            ))
            .bind(&stored.scope)
            .bind(&stored.database_type)
            .bind(&stored.phase)
            .bind(&stored.checkpoint_data)
            .bind(stored.created_at.to_rfc3339())
            .bind(version)
            .execute()
            .await
            .with_context(|| format!("Failed to store checkpoint {}/{}", id.scope, id.phase))?;
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        self.ensure_table().await?;
        let row = self
            .warehouse
            .client()
            .query(&format!(
                "SELECT checkpoint_data, created_at FROM {} FINAL \
                 WHERE scope = ? AND database_type = ? AND phase = ? LIMIT 1",
                self.table
            ))
            .bind(&id.scope)
            .bind(&id.database_type)
            .bind(&id.phase)
            .fetch_optional::<StateRow>()
            .await
            .with_context(|| format!("Failed to read checkpoint {}/{}", id.scope, id.phase))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map(|t| t.with_timezone(&Utc))
            .context("Invalid checkpoint timestamp")?;

        Ok(Some(StoredCheckpoint {
            checkpoint_data: row.checkpoint_data,
            database_type: id.database_type.clone(),
            scope: id.scope.clone(),
            phase: id.phase.clone(),
            created_at,
        }))
    }

    async fn clear_scope(&self, scope: &str) -> Result<()> {
        self.ensure_table().await?;
        self.warehouse
            .client()
            .query(&format!("DELETE FROM {} WHERE scope = ?", self.table))
            .bind(scope)
            .execute()
            .await
            .with_context(|| format!("Failed to clear run history for {scope}"))?;
        Ok(())
    }
}
