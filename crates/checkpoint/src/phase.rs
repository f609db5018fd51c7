//! Sync phase enumeration for checkpoint tracking.

use serde::{Deserialize, Serialize};

/// Represents the points in a pipeline's life at which checkpoints are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// The replication slot's consistent point, recorded right after slot
    /// creation and before the snapshot is read.
    ///
    /// Every change committed after this position is delivered by the slot,
    /// so it is also the merge version given to snapshot rows.
    SnapshotStart,

    /// Recorded once every snapshot row has been merged.
    SnapshotEnd,

    /// The last LSN acknowledged to the slot after a durable destination write.
    Acknowledged,
}

impl SyncPhase {
    /// Get the string representation of this phase.
    ///
    /// Used for:
    /// - Checkpoint file naming (e.g., `checkpoint_orders_acknowledged.json`)
    /// - Logging and debugging output
    pub fn as_str(&self) -> &str {
        match self {
            SyncPhase::SnapshotStart => "snapshot_start",
            SyncPhase::SnapshotEnd => "snapshot_end",
            SyncPhase::Acknowledged => "acknowledged",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
