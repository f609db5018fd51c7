//! Initial snapshot of the replicated tables.
//!
//! The slot is created first and its consistent point recorded. A second
//! connection then opens a `REPEATABLE READ` transaction whose snapshot is
//! pinned by its first statement, and every table is read through a cursor
//! in that transaction.
//!
//! Snapshot rows are versioned with the consistent point. A write that lands
//! between slot creation and the pin is both visible in the snapshot and
//! decoded by the slot, where it carries its (higher) commit LSN, so the
//! streamed version always wins the merge. Nothing committed after the slot
//! was created can be missed.

use async_stream::try_stream;
use async_trait::async_trait;
use ch_sync_postgresql::value::row_to_record;
use ch_sync_postgresql::{batches, catalog, classify_pg_error, connect, quote_ident, RowSource};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use sync_core::{ChangeEvent, Lsn, Operation, Record, Result, SyncError};
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::slot::Slot;
use crate::source::{ReplicationOptions, Snapshot, SnapshotBatches};

/// Set up the publication and slot for `options` and, if requested, pin a
/// snapshot of the tables' current contents.
///
/// With `reset`, an existing slot and publication of the same names are
/// dropped first. Without it an existing slot is an error: the caller
/// decided this is a first run, so a leftover slot means state went out of
/// sync and must be resolved by an explicit reset.
pub async fn init_replication(connection_string: &str, options: &ReplicationOptions) -> Result<Snapshot> {
    if options.table_names.is_empty() {
        return Err(SyncError::config(format!(
            "No tables configured for publication '{}'",
            options.publication_name
        )));
    }

    let client = connect(connection_string).await?;
    ch_sync_postgresql::preflight::check_source(&client, true).await?;

    let slot = Slot::new(Arc::new(client), options.clone());
    if options.reset {
        warn!(
            "Resetting replication slot {} and publication {}",
            options.slot_name, options.publication_name
        );
        slot.drop_if_exists().await?;
        slot.drop_publication().await?;
    } else if slot.exists().await? {
        return Err(SyncError::config(format!(
            "Replication slot '{}' already exists but no snapshot was taken for it; \
             run with reset to recreate it",
            options.slot_name
        )));
    }

    slot.ensure_publication().await?;
    let consistent_lsn = slot.create().await?;

    if !options.persist_snapshot {
        info!("Skipping snapshot for slot {}", options.slot_name);
        return Ok(Snapshot::new(consistent_lsn, None));
    }

    let snapshot_client = Arc::new(connect(connection_string).await?);
    snapshot_client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await
        .map_err(|e| classify_pg_error(e, "Failed to begin snapshot transaction"))?;

    // The first statement pins the snapshot, so resolve keys eagerly rather
    // than when the stream is first polled.
    let mut tables = Vec::with_capacity(options.table_names.len());
    for table in &options.table_names {
        let pk = catalog::primary_key_columns(&snapshot_client, &options.schema, table).await?;
        tables.push((table.clone(), catalog::merge_key_or_id(pk)));
    }
    info!(
        "Snapshot pinned for {} tables at {}",
        tables.len(),
        consistent_lsn
    );

    let batches: SnapshotBatches = Box::pin(snapshot_batches(
        snapshot_client,
        options.schema.clone(),
        tables,
        consistent_lsn,
        options.batch_size,
    ));
    Ok(Snapshot::new(consistent_lsn, Some(batches)))
}

fn snapshot_batches(
    client: Arc<Client>,
    schema: String,
    tables: Vec<(String, Vec<String>)>,
    lsn: Lsn,
    batch_size: usize,
) -> impl Stream<Item = Result<Vec<ChangeEvent>>> + Send + 'static {
    try_stream! {
        for (table, key_columns) in tables {
            let cursor = CursorSource::open(client.clone(), &schema, &table).await?;
            let mut rows = Box::pin(batches(cursor, batch_size));
            let mut total = 0usize;

            while let Some(batch) = rows.next().await {
                let batch = batch?;
                total += batch.len();
                yield batch
                    .into_iter()
                    .map(|row| snapshot_event(&schema, &table, &key_columns, row, lsn))
                    .collect::<Vec<_>>();
            }
            drop(rows);

            client
                .batch_execute("CLOSE snapshot_cursor")
                .await
                .map_err(|e| classify_pg_error(e, "Failed to close snapshot cursor"))?;
            info!("Snapshot of {schema}.{table}: {total} rows");
        }

        client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| classify_pg_error(e, "Failed to release snapshot"))?;
    }
}

fn snapshot_event(schema: &str, table: &str, key_columns: &[String], row: Record, lsn: Lsn) -> ChangeEvent {
    ChangeEvent {
        schema: schema.to_string(),
        table: table.to_string(),
        operation: Operation::Insert,
        key_columns: key_columns.to_vec(),
        row,
        lsn,
    }
}

/// Server-side cursor over one table inside the snapshot transaction.
struct CursorSource {
    client: Arc<Client>,
}

impl CursorSource {
    async fn open(client: Arc<Client>, schema: &str, table: &str) -> Result<Self> {
        let declare = format!(
            "DECLARE snapshot_cursor NO SCROLL CURSOR FOR SELECT * FROM {}.{}",
            quote_ident(schema),
            quote_ident(table)
        );
        client
            .batch_execute(&declare)
            .await
            .map_err(|e| classify_pg_error(e, &format!("Failed to open snapshot cursor on {schema}.{table}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RowSource for CursorSource {
    async fn fetch(&mut self, max: usize) -> Result<Vec<Record>> {
        let rows = self
            .client
            .query(format!("FETCH FORWARD {max} FROM snapshot_cursor").as_str(), &[])
            .await
            .map_err(|e| classify_pg_error(e, "Failed to fetch from snapshot cursor"))?;
        rows.iter().map(row_to_record).collect()
    }
}
