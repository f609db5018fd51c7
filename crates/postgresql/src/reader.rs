//! Batched source reader.
//!
//! A query is bound to a portal inside a transaction and drained in fixed-size
//! chunks, so resident memory is bounded by the batch size regardless of the
//! table size. Batches are produced lazily: the next chunk is only fetched
//! when the consumer polls for it.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;
use sync_core::{Record, Result};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Portal, Transaction};
use tracing::debug;

use crate::value::row_to_record;
use crate::{catalog, classify_pg_error, connect};

/// A lazily evaluated sequence of row batches.
pub type RecordBatches = BoxStream<'static, Result<Vec<Record>>>;

/// Anything that can hand out rows a chunk at a time.
#[async_trait]
pub trait RowSource: Send {
    /// Fetch up to `max` rows; an empty result means the source is exhausted.
    async fn fetch(&mut self, max: usize) -> Result<Vec<Record>>;
}

/// Pull the next batch. Returns `None` once the source is exhausted.
///
/// A short batch is the last one, so no extra round trip is spent
/// discovering the end.
async fn next_batch<S: RowSource + ?Sized>(
    source: &mut S,
    batch_size: usize,
    exhausted: &mut bool,
) -> Result<Option<Vec<Record>>> {
    if *exhausted {
        return Ok(None);
    }
    let rows = source.fetch(batch_size).await?;
    if rows.len() < batch_size {
        *exhausted = true;
    }
    if rows.is_empty() {
        Ok(None)
    } else {
        Ok(Some(rows))
    }
}

/// Turn a [`RowSource`] into a stream of batches of at most `batch_size` rows.
pub fn batches<S>(mut source: S, batch_size: usize) -> impl Stream<Item = Result<Vec<Record>>> + Send
where
    S: RowSource + 'static,
{
    let batch_size = batch_size.max(1);
    try_stream! {
        let mut exhausted = false;
        while let Some(batch) = next_batch(&mut source, batch_size, &mut exhausted).await? {
            yield batch;
        }
    }
}

/// Row count for one portal fetch; the protocol limit is an `i32`.
fn portal_fetch_size(max: usize) -> i32 {
    i32::try_from(max).unwrap_or(i32::MAX)
}

/// Portal-backed row source inside an open transaction.
struct PortalSource<'a> {
    tx: &'a Transaction<'a>,
    portal: Portal,
}

#[async_trait]
impl RowSource for PortalSource<'_> {
    async fn fetch(&mut self, max: usize) -> Result<Vec<Record>> {
        let rows = self
            .tx
            .query_portal(&self.portal, portal_fetch_size(max))
            .await
            .map_err(|e| classify_pg_error(e, "Failed to fetch rows from cursor"))?;
        rows.iter().map(row_to_record).collect()
    }
}

/// Run `query` with text `params` on a fresh connection and stream the rows
/// in batches of `batch_size`.
///
/// The connection is owned by the stream and closed when it is dropped.
/// Parameters are sent as text; cast them in SQL (`$1::text::bigint`).
pub fn read_query(
    connection_string: String,
    query: String,
    params: Vec<String>,
    batch_size: usize,
) -> impl Stream<Item = Result<Vec<Record>>> + Send {
    let batch_size = batch_size.max(1);
    try_stream! {
        let mut client = connect(&connection_string).await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| classify_pg_error(e, "Failed to begin read transaction"))?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let portal = tx
            .bind(query.as_str(), &refs)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to bind query"))?;
        debug!("Reading in batches of {batch_size}: {query}");

        let mut source = PortalSource { tx: &tx, portal };
        let mut exhausted = false;
        while let Some(batch) = next_batch(&mut source, batch_size, &mut exhausted).await? {
            yield batch;
        }
        drop(source);

        tx.commit()
            .await
            .map_err(|e| classify_pg_error(e, "Failed to close read transaction"))?;
    }
}

/// The relational source as seen by the incremental path.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Merge key columns of a table (primary key, or `id` without one).
    async fn merge_key(&self, table: &str) -> Result<Vec<String>>;

    /// SQL type of a column, used to cast text watermarks.
    async fn column_type(&self, table: &str, column: &str) -> Result<String>;

    /// Execute a query and stream its rows in batches.
    async fn read(&self, query: String, params: Vec<String>, batch_size: usize) -> Result<RecordBatches>;
}

/// [`TableSource`] over a PostgreSQL schema. Every call opens its own
/// connection; cursors are never shared between reads.
pub struct PgTableSource {
    connection_string: String,
    schema: String,
}

impl PgTableSource {
    pub fn new(connection_string: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

#[async_trait]
impl TableSource for PgTableSource {
    async fn merge_key(&self, table: &str) -> Result<Vec<String>> {
        let client = connect(&self.connection_string).await?;
        let pk = catalog::primary_key_columns(&client, &self.schema, table).await?;
        Ok(catalog::merge_key_or_id(pk))
    }

    async fn column_type(&self, table: &str, column: &str) -> Result<String> {
        let client = connect(&self.connection_string).await?;
        catalog::column_type(&client, &self.schema, table, column).await
    }

    async fn read(&self, query: String, params: Vec<String>, batch_size: usize) -> Result<RecordBatches> {
        Ok(Box::pin(read_query(
            self.connection_string.clone(),
            query,
            params,
            batch_size,
        )))
    }
}
