//! Checkpoint management for ch-sync
//!
//! Provides storage-agnostic persistence for two kinds of progress records:
//!
//! - **Checkpoints**: database-specific positions (e.g. the last acknowledged
//!   PostgreSQL LSN) implementing the [`Checkpoint`] trait, tagged with the
//!   [`SyncPhase`] they were taken at.
//! - **Run history**: the per-pipeline [`State`] machine that tells the
//!   orchestrator whether a pipeline has completed its initial snapshot.
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - One JSON file per scope and phase
//! - `MemoryStore` - Process-local, used by tests and dry runs
//! - A ClickHouse-backed store lives in the clickhouse-sink crate
//!
//! All backends implement [`CheckpointStore`].

mod filesystem;
mod memory;
mod phase;
pub mod state;
pub mod store;


pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use phase::SyncPhase;
pub use state::{State, StateID, StateStore};
pub use store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Trait that database-specific checkpoints must implement.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct SequenceCheckpoint {
///     pub sequence: i64,
/// }
///
/// impl Checkpoint for SequenceCheckpoint {
///     const DATABASE_TYPE: &'static str = "sequence";
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Database type identifier (e.g. "postgresql-wal2json").
    ///
    /// Stored alongside the serialized checkpoint and validated on read.
    const DATABASE_TYPE: &'static str;
}

/// Serialize and store a checkpoint for `scope` at `phase`.
pub async fn save_checkpoint<C: Checkpoint>(
    store: &dyn CheckpointStore,
    scope: &str,
    phase: SyncPhase,
    checkpoint: &C,
) -> anyhow::Result<()> {
    let id = CheckpointID::new(C::DATABASE_TYPE, scope, phase.as_str());
    store
        .store_checkpoint(&id, serde_json::to_string(checkpoint)?)
        .await
}

/// Load the checkpoint for `scope` at `phase`, if one was stored.
pub async fn load_checkpoint<C: Checkpoint>(
    store: &dyn CheckpointStore,
    scope: &str,
    phase: SyncPhase,
) -> anyhow::Result<Option<C>> {
    let id = CheckpointID::new(C::DATABASE_TYPE, scope, phase.as_str());
    match store.read_checkpoint(&id).await? {
        Some(stored) => Ok(Some(stored.parse()?)),
        None => Ok(None),
    }
}
