//! Core types for the ch-sync framework.
//!
//! This crate provides the foundational types shared by the source,
//! destination and orchestration crates:
//!
//! - [`Record`] - A semi-structured row, keyed by column name
//! - [`ChangeEvent`] - One decoded row-level change with its source LSN
//! - [`WriteBatch`] - A batch of versioned rows bound for a destination merge
//! - [`Lsn`] - PostgreSQL write-ahead log position
//! - [`SyncError`] - The error taxonomy used across crate boundaries
//! - [`path`] - Safe nested lookups over `serde_json::Value`
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── ch-sync-postgresql                  (rows → Record, batched reads)
//!    ├─── ch-sync-postgresql-wal2json-source  (wal2json → ChangeEvent)
//!    ├─── ch-sync-clickhouse-sink             (WriteBatch → ReplacingMergeTree)
//!    └─── ch-sync                             (transformer, orchestrator)
//! ```

pub mod error;
pub mod lsn;
pub mod path;
pub mod types;

pub use error::{ErrorContext, Result, SyncError};
pub use lsn::Lsn;
pub use path::PathSegment;
pub use types::{ChangeEvent, Operation, Record, WriteBatch, WriteRow};
