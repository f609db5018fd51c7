//! Incremental batch replication.
//!
//! Tables pulled by watermark instead of logical decoding: every run reads
//! the destination's maximum of the tracking column and pulls only rows past
//! it, in batches, merging each batch as it arrives.

use anyhow::Context;
use async_trait::async_trait;
use ch_sync_postgresql::{quote_ident, TableSource};
use clickhouse_sink::Warehouse;
use futures::TryStreamExt;
use std::sync::Arc;
use sync_core::{WriteBatch, WriteRow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::IncrementalConfig;
use crate::orchestrator::{combine_errors, RunStats, SyncPipeline};
use crate::watermark::get_watermark;
use crate::{destination_table, load_version};

/// `SELECT` for one pull. With a watermark, the text parameter `$1` is cast
/// to the tracking column's type.
pub fn build_query(
    schema: &str,
    table: &str,
    column: &str,
    watermark_type: Option<&str>,
    limit: u64,
) -> String {
    let column = quote_ident(column);
    let mut sql = format!("SELECT * FROM {}.{}", quote_ident(schema), quote_ident(table));
    if let Some(pg_type) = watermark_type {
        sql.push_str(&format!(" WHERE {column} > $1::text::{pg_type}"));
    }
    sql.push_str(&format!(" ORDER BY {column} LIMIT {limit}"));
    sql
}

pub struct IncrementalPipeline {
    name: String,
    dataset: String,
    config: IncrementalConfig,
    source: Arc<dyn TableSource>,
    warehouse: Arc<dyn Warehouse>,
}

impl IncrementalPipeline {
    pub fn new(
        name: impl Into<String>,
        dataset: impl Into<String>,
        config: IncrementalConfig,
        source: Arc<dyn TableSource>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            name: name.into(),
            dataset: dataset.into(),
            config,
            source,
            warehouse,
        }
    }

    /// Pull one table past its watermark. Returns the number of rows merged.
    async fn sync_table(
        &self,
        table: &str,
        column: &str,
        version: u64,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let target = destination_table(&self.dataset, table);
        let watermark = get_watermark(self.warehouse.as_ref(), &target, column).await;

        let (query, params) = match watermark {
            Some(value) => {
                let pg_type = self.source.column_type(table, column).await?;
                info!("Resuming {table} from {column} > {value}");
                let query = build_query(
                    &self.config.schema,
                    table,
                    column,
                    Some(&pg_type),
                    self.config.row_limit,
                );
                (query, vec![value])
            }
            None => {
                info!("No watermark for {table}, loading from the start");
                let query =
                    build_query(&self.config.schema, table, column, None, self.config.row_limit);
                (query, Vec::new())
            }
        };

        let key_columns = self.source.merge_key(table).await?;
        let mut batches = self
            .source
            .read(query, params, self.config.batch_size)
            .await?;

        let mut merged = 0u64;
        while let Some(rows) = batches.try_next().await? {
            let mut batch = WriteBatch::new(&target, key_columns.clone());
            for record in rows {
                batch.push(WriteRow::upsert(record, version));
            }
            self.warehouse.merge(&batch).await?;
            merged += batch.len() as u64;

            if cancel.is_cancelled() {
                info!("Stopping {table} after {merged} rows on shutdown");
                break;
            }
        }

        info!("Loaded {merged} rows from {table} into {target}");
        Ok(merged)
    }
}

#[async_trait]
impl SyncPipeline for IncrementalPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunStats> {
        let version = load_version();
        let mut stats = RunStats::default();
        let mut errors = Vec::new();

        // Tables are independent: a failing one does not stop the rest.
        let tables = self.config.tables.entries();
        for (table, column) in &tables {
            if cancel.is_cancelled() {
                break;
            }
            match self
                .sync_table(table, column, version, cancel)
                .await
                .with_context(|| format!("Failed to sync table {table}"))
            {
                Ok(rows) => stats.record(table, rows),
                Err(e) => {
                    error!("{e:#}");
                    errors.push(e);
                }
            }
        }
        combine_errors(errors, tables.len(), "tables")?;
        Ok(stats)
    }
}
