//! ch-sync
//!
//! Replicates PostgreSQL tables into ClickHouse.
//!
//! # Pipelines
//!
//! - `incremental` - tables pulled by watermark (`id`, `updated_at`, ...):
//!   the destination's maximum of the tracking column decides where the next
//!   pull resumes
//! - `cdc` - logical decoding through wal2json: the first run snapshots the
//!   tables at the slot's consistent point, every run streams committed
//!   changes and acknowledges them once merged
//! - `log_batch` - inline-ad log rows pulled by `created_at` watermark and
//!   flattened by the [`ads`] transformer
//!
//! Every destination write is a merge keyed by primary key and versioned, so
//! replaying a batch after a crash leaves the destination unchanged.
//!
//! # CLI Usage
//!
//! ```bash
//! # Check source and destination prerequisites
//! ch-sync --config ch-sync.toml preflight
//!
//! # Run every pipeline once
//! ch-sync --config ch-sync.toml run
//!
//! # Run two pipelines every ten minutes until interrupted
//! ch-sync run --pipeline common_tables --pipeline logs --every 10m
//!
//! # Drop a CDC pipeline's slots and run history so it snapshots again
//! ch-sync reset logs
//! ```

pub mod ads;
pub mod cdc;
pub mod config;
pub mod connect;
pub mod incremental;
pub mod log_batch;
pub mod orchestrator;
pub mod reconcile;
pub mod watermark;

pub use config::Config;
pub use orchestrator::{Orchestrator, RunReport, RunStats, SyncPipeline};

use sync_core::SyncError;

/// Destination table for a source table: `{dataset}___{table}`.
pub fn destination_table(dataset: &str, table: &str) -> String {
    format!("{dataset}___{table}")
}

/// Merge version of rows loaded by a batch pull: the load time in
/// microseconds, so a later load of the same key wins.
pub fn load_version() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// Whether a configuration error is anywhere in the chain.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<SyncError>())
        .any(SyncError::is_config)
}

/// Process exit code for a failed run: 1 for configuration and preflight
/// errors, 2 for anything else.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    if is_config_error(err) {
        1
    } else {
        2
    }
}
