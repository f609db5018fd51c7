//! PostgreSQL logical replication checkpoint management
//!
//! LSN-based checkpoints recorded for each replication slot: the slot's
//! consistent point when a snapshot starts, and every acknowledged position
//! while streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::Lsn;

/// PostgreSQL logical replication checkpoint containing LSN and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgreSQLLogicalCheckpoint {
    /// LSN position in the WAL stream (e.g., "0/1949850")
    pub lsn: Lsn,
    /// Timestamp when checkpoint was created
    pub timestamp: DateTime<Utc>,
}

impl PostgreSQLLogicalCheckpoint {
    pub fn new(lsn: Lsn) -> Self {
        Self {
            lsn,
            timestamp: Utc::now(),
        }
    }
}

impl checkpoint::Checkpoint for PostgreSQLLogicalCheckpoint {
    const DATABASE_TYPE: &'static str = "postgresql-wal2json";
}
