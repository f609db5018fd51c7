//! Inline ads pulled from the log table by `created_at` watermark, without
//! a replication slot.

use anyhow::Context;
use async_trait::async_trait;
use ch_sync_postgresql::{quote_ident, TableSource};
use clickhouse_sink::Warehouse;
use futures::TryStreamExt;
use std::sync::Arc;
use sync_core::{WriteBatch, WriteRow};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ads::{self, AD_KEY_COLUMN};
use crate::config::LogBatchConfig;
use crate::orchestrator::{RunStats, SyncPipeline};
use crate::watermark::get_watermark;
use crate::{destination_table, load_version};

/// Rows whose `name` is one of `names` (bound as `$1..$n`), past the
/// watermark when its type is given (bound as `$n+1`).
pub fn build_query(config: &LogBatchConfig, watermark_type: Option<&str>) -> String {
    let placeholders: Vec<String> = (1..=config.names.len()).map(|i| format!("${i}")).collect();
    let column = quote_ident(&config.watermark_column);
    let mut sql = format!(
        "SELECT * FROM {}.{} WHERE \"name\" IN ({})",
        quote_ident(&config.schema),
        quote_ident(&config.table),
        placeholders.join(", ")
    );
    if let Some(pg_type) = watermark_type {
        sql.push_str(&format!(
            " AND {column} > ${}::text::{pg_type}",
            config.names.len() + 1
        ));
    }
    sql.push_str(&format!(" ORDER BY {column}"));
    sql
}

pub struct LogBatchPipeline {
    name: String,
    dataset: String,
    config: LogBatchConfig,
    source: Arc<dyn TableSource>,
    warehouse: Arc<dyn Warehouse>,
}

impl LogBatchPipeline {
    pub fn new(
        name: impl Into<String>,
        dataset: impl Into<String>,
        config: LogBatchConfig,
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
}

#[async_trait]
impl SyncPipeline for LogBatchPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<RunStats> {
        let target = destination_table(&self.dataset, &self.config.target);
        let column = &self.config.watermark_column;
        let watermark = get_watermark(self.warehouse.as_ref(), &target, column).await;

        let mut params = self.config.names.clone();
        let query = match watermark {
            Some(value) => {
                let pg_type = self.source.column_type(&self.config.table, column).await?;
                info!("Resuming {} from {column} > {value}", self.config.table);
                params.push(value);
                build_query(&self.config, Some(&pg_type))
            }
            None => build_query(&self.config, None),
        };

        let version = load_version();
        let mut batches = self
            .source
            .read(query, params, self.config.batch_size)
            .await?;

        let mut stats = RunStats::default();
        let mut rows_read = 0u64;
        while let Some(rows) = batches
            .try_next()
            .await
            .with_context(|| format!("Failed to read {}", self.config.table))?
        {
            rows_read += rows.len() as u64;
            let mut batch = WriteBatch::new(&target, vec![AD_KEY_COLUMN.to_string()]);
            for row in &rows {
                for ad in ads::transform(row) {
                    batch.push(WriteRow::upsert(ad.into_record(), version));
                }
            }
            if !batch.is_empty() {
                self.warehouse
                    .merge(&batch)
                    .await
                    .with_context(|| format!("Failed to merge into {target}"))?;
                stats.record(&target, batch.len() as u64);
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        info!(
            "Flattened {rows_read} log rows from {} into {} ads",
            self.config.table, stats.rows_merged
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LogBatchConfig {
        LogBatchConfig {
            schema: "public".into(),
            table: "server_logs_log".into(),
            names: vec!["InlineAdsViewSet.car".into(), "ad_fetch".into()],
            target: "inline_ad_logs".into(),
            watermark_column: "created_at".into(),
            batch_size: 4000,
        }
    }

    #[test]
    fn test_query_without_watermark() {
        assert_eq!(
            build_query(&config(), None),
            "SELECT * FROM \"public\".\"server_logs_log\" WHERE \"name\" IN ($1, $2) \
             ORDER BY \"created_at\""
        );
    }

    #[test]
    fn test_query_with_watermark_binds_after_names() {
        assert_eq!(
            build_query(&config(), Some("timestamp with time zone")),
            "SELECT * FROM \"public\".\"server_logs_log\" WHERE \"name\" IN ($1, $2) \
             AND \"created_at\" > $3::text::timestamp with time zone ORDER BY \"created_at\""
        );
    }
}
