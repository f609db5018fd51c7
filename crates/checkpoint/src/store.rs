//! Checkpoint storage trait and types
//!
//! This module defines the CheckpointStore trait for backend-agnostic
//! checkpoint storage operations, plus shared types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Checkpoint;

/// Checkpoint identifier for storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Database type (e.g., "postgresql-wal2json", "pipeline-state")
    pub database_type: String,
    /// What the checkpoint belongs to, usually `pipeline/slot`
    pub scope: String,
    /// Sync phase (e.g. "snapshot_start", "acknowledged")
    pub phase: String,
}

impl CheckpointID {
    pub fn new(
        database_type: impl Into<String>,
        scope: impl Into<String>,
        phase: impl Into<String>,
    ) -> Self {
        Self {
            database_type: database_type.into(),
            scope: scope.into(),
            phase: phase.into(),
        }
    }
}

/// Checkpoint data stored in backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// Serialized checkpoint (e.g. an LSN, or a run-history state record)
    pub checkpoint_data: String,
    /// Database type for validation
    pub database_type: String,
    pub scope: String,
    /// Sync phase for validation
    pub phase: String,
    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,
}

impl StoredCheckpoint {
    pub fn new(id: &CheckpointID, checkpoint_data: String) -> Self {
        Self {
            checkpoint_data,
            database_type: id.database_type.clone(),
            scope: id.scope.clone(),
            phase: id.phase.clone(),
            created_at: Utc::now(),
        }
    }

    /// Parse the stored data into a typed checkpoint.
    ///
    /// Fails if the stored database type does not match `C::DATABASE_TYPE`.
    pub fn parse<C: Checkpoint>(&self) -> Result<C> {
        if self.database_type != C::DATABASE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::DATABASE_TYPE,
                self.database_type
            );
        }
        Ok(serde_json::from_str(&self.checkpoint_data)?)
    }
}

/// Trait for checkpoint storage operations.
///
/// This trait abstracts the storage backend for checkpoint operations,
/// allowing the same checkpoint logic to work with:
/// - Filesystem storage (`FilesystemStore`)
/// - In-process storage (`MemoryStore`)
/// - The destination warehouse (`ClickHouseCheckpointStore`)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint, replacing any earlier one with the same id.
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()>;

    /// Read a checkpoint from the storage backend.
    ///
    /// Returns None if the checkpoint doesn't exist.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>>;

    /// Remove every checkpoint recorded for `scope`.
    async fn clear_scope(&self, scope: &str) -> Result<()>;
}
