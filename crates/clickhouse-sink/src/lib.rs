//! ClickHouse warehouse sink.
//!
//! This crate defines the [`Warehouse`] trait that pipelines write through,
//! and two implementations:
//!
//! - [`ClickHouseWarehouse`] merges batches into `ReplacingMergeTree`
//!   tables over the HTTP interface
//! - [`MemoryWarehouse`] keeps the same merge semantics in process, for tests
//!
//! [`ClickHouseCheckpointStore`] keeps pipeline run history in the
//! destination database.

mod memory;
mod preflight;
pub mod schema;
mod state_store;
mod traits;
mod warehouse;

pub use memory::MemoryWarehouse;
pub use state_store::ClickHouseCheckpointStore;
pub use traits::Warehouse;
pub use warehouse::{classify_clickhouse_error, ClickHouseConfig, ClickHouseWarehouse};
