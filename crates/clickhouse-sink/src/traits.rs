//! Warehouse trait definition.
//!
//! Pipelines only need three things from the destination: merge a batch of
//! rows keyed by primary key, report the current maximum of a column, and
//! tell whether a table exists. Running arbitrary SQL covers post-merge
//! reconciliation.

use sync_core::{Result, WriteBatch};

/// Trait for writing data to the analytical warehouse.
///
/// # Merge semantics
///
/// `merge` is an upsert keyed by `batch.key_columns`: for every key, the row
/// with the highest `version` is the one observed by later reads, and a
/// tombstone (`deleted`) makes the key unobservable. Applying the same
/// batch twice leaves the observable state unchanged, which is what makes
/// replay after a crash safe.
///
/// ```ignore
/// pub async fn load<W: Warehouse + ?Sized>(warehouse: &W, batch: WriteBatch) -> Result<()> {
///     warehouse.merge(&batch).await
/// }
/// ```
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Maximum of `column` over the observable rows of `table`, rendered as
    /// text. `None` when no observable row has a non-null value.
    ///
    /// Fails if the table or the column does not exist.
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>>;

    /// Merge a batch of rows into `batch.table`, creating the table or
    /// adding columns as needed.
    async fn merge(&self, batch: &WriteBatch) -> Result<()>;

    /// Tombstone, at `version`, every observable row of `table` last written
    /// with a lower version. After a fresh snapshot versioned at `version`,
    /// those are the rows whose source rows no longer exist.
    async fn retire_older_than(&self, table: &str, version: u64) -> Result<()>;

    /// Run a statement against the warehouse.
    async fn execute(&self, sql: &str) -> Result<()>;
}
