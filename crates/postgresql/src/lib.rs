//! Shared PostgreSQL utilities for ch-sync
//!
//! - [`connect`] opens a client and drives its connection task
//! - [`preflight`] verifies logical-decoding prerequisites before any slot is touched
//! - [`catalog`] looks up primary keys and column types
//! - [`value`] converts PostgreSQL values into JSON, for binary rows and wal2json text alike
//! - [`reader`] is the batched source reader used by the incremental path

pub mod catalog;
mod connect;
pub mod preflight;
pub mod reader;
pub mod value;

pub use connect::{classify_pg_error, connect, quote_ident};
pub use reader::{batches, PgTableSource, RecordBatches, RowSource, TableSource};
