//! The replication source as seen by the CDC pipelines.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use sync_core::{ChangeEvent, Lsn, Result};
use tracing::info;

use crate::slot::{ChangeFeed, Slot};

/// Identity and behaviour of one slot/publication pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOptions {
    pub slot_name: String,
    pub publication_name: String,
    pub schema: String,
    pub table_names: Vec<String>,
    /// Read the current table contents through the slot's snapshot.
    pub persist_snapshot: bool,
    /// Drop an existing slot and publication of the same names first.
    pub reset: bool,
    /// Rows per snapshot batch.
    pub batch_size: usize,
}

/// Rows of one snapshot batch, already shaped as inserts versioned at the
/// slot's consistent point.
pub type SnapshotBatches = BoxStream<'static, Result<Vec<ChangeEvent>>>;

/// Result of initializing replication.
pub struct Snapshot {
    /// Position the slot was created at; every change after it is streamed.
    pub consistent_lsn: Lsn,
    batches: Option<SnapshotBatches>,
}

impl Snapshot {
    pub fn new(consistent_lsn: Lsn, batches: Option<SnapshotBatches>) -> Self {
        Self {
            consistent_lsn,
            batches,
        }
    }

    /// Take the snapshot rows. The snapshot can only be read once, so this
    /// consumes the handle; `None` when the snapshot was not persisted.
    pub fn into_batches(self) -> Option<SnapshotBatches> {
        self.batches
    }
}

/// Slot lifecycle and change access for one source database.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool>;

    /// Create the publication and slot and pin a snapshot of the tables.
    async fn init_replication(&self, options: &ReplicationOptions) -> Result<Snapshot>;

    /// Open a fresh connection to an existing slot.
    async fn open_feed(&self, options: &ReplicationOptions) -> Result<Box<dyn ChangeFeed>>;

    /// Drop the slot and its publication if present.
    async fn drop_replication(&self, options: &ReplicationOptions) -> Result<()>;
}

/// [`ReplicationSource`] backed by a PostgreSQL server with wal2json.
pub struct PgReplicationSource {
    connection_string: String,
}

impl PgReplicationSource {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }

    async fn slot(&self, options: &ReplicationOptions) -> Result<Slot> {
        let client = ch_sync_postgresql::connect(&self.connection_string).await?;
        Ok(Slot::new(Arc::new(client), options.clone()))
    }
}

#[async_trait]
impl ReplicationSource for PgReplicationSource {
    async fn slot_exists(&self, slot_name: &str) -> Result<bool> {
        let client = ch_sync_postgresql::connect(&self.connection_string).await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await
            .map_err(|e| {
                ch_sync_postgresql::classify_pg_error(e, "Failed to check for replication slot")
            })?;
        Ok(row.is_some())
    }

    async fn init_replication(&self, options: &ReplicationOptions) -> Result<Snapshot> {
        crate::snapshot::init_replication(&self.connection_string, options).await
    }

    async fn open_feed(&self, options: &ReplicationOptions) -> Result<Box<dyn ChangeFeed>> {
        let slot = self.slot(options).await?;
        slot.verify_publication().await?;
        info!("Connected to replication slot {}", slot.name());
        Ok(Box::new(slot))
    }

    async fn drop_replication(&self, options: &ReplicationOptions) -> Result<()> {
        let slot = self.slot(options).await?;
        slot.drop_if_exists().await?;
        slot.drop_publication().await
    }
}
