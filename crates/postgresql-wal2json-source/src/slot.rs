//! Replication slot and publication management
//!
//! Slots are driven through the SQL interface (`pg_logical_slot_peek_changes`,
//! `pg_replication_slot_advance`) over a regular connection, with wal2json
//! as the output plugin. The publication is the authoritative table set of a
//! slot: it is created to match the configured tables exactly, and any later
//! drift between the two is reported as a configuration error.

use async_trait::async_trait;
use ch_sync_postgresql::{classify_pg_error, quote_ident};
use std::collections::BTreeSet;
use std::sync::Arc;
use sync_core::{Lsn, Result, SyncError};
use tokio_postgres::Client as PgClient;
use tracing::{debug, info};

use crate::wal2json::WalMessage;
use crate::ReplicationOptions;

/// Reads and acknowledges decoded changes of one slot.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Peek at up to roughly `max_changes` changes past the slot's confirmed
    /// position, without consuming them. Decoding only stops at transaction
    /// boundaries, so whole transactions are returned.
    async fn peek(&self, max_changes: usize) -> Result<Vec<WalMessage>>;

    /// Move the slot's confirmed position to `lsn`, releasing WAL up to it.
    async fn advance(&self, lsn: Lsn) -> Result<()>;
}

/// A logical replication slot and its publication
pub struct Slot {
    /// The PostgreSQL client connection
    pg_client: Arc<PgClient>,
    options: ReplicationOptions,
}

impl Slot {
    pub fn new(pg_client: Arc<PgClient>, options: ReplicationOptions) -> Self {
        Self { pg_client, options }
    }

    pub fn name(&self) -> &str {
        &self.options.slot_name
    }

    pub async fn exists(&self) -> Result<bool> {
        let rows = self
            .pg_client
            .query(
                "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.options.slot_name],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to check for existing replication slot"))?;
        Ok(!rows.is_empty())
    }

    /// Create the slot with the wal2json plugin and return its consistent point.
    pub async fn create(&self) -> Result<Lsn> {
        info!("Creating logical replication slot: {}", self.name());
        let row = self
            .pg_client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'wal2json')",
                &[&self.options.slot_name],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to create logical replication slot"))?;
        let lsn: Lsn = row.get::<_, String>(0).parse()?;
        info!("Created replication slot {} at {}", self.name(), lsn);
        Ok(lsn)
    }

    pub async fn drop_if_exists(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        info!("Dropping replication slot: {}", self.name());
        self.pg_client
            .execute(
                "SELECT pg_drop_replication_slot($1)",
                &[&self.options.slot_name],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to drop replication slot"))?;
        Ok(())
    }

    fn qualified_tables(&self) -> BTreeSet<String> {
        self.options
            .table_names
            .iter()
            .map(|t| format!("{}.{}", self.options.schema, t))
            .collect()
    }

    /// Tables currently in the publication, or `None` if it does not exist.
    pub async fn publication_tables(&self) -> Result<Option<BTreeSet<String>>> {
        let exists = self
            .pg_client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.options.publication_name],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to look up publication"))?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let rows = self
            .pg_client
            .query(
                "SELECT schemaname::text, tablename::text FROM pg_publication_tables WHERE pubname = $1",
                &[&self.options.publication_name],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to list publication tables"))?;
        Ok(Some(
            rows.iter()
                .map(|r| format!("{}.{}", r.get::<_, String>(0), r.get::<_, String>(1)))
                .collect(),
        ))
    }

    /// Fail if the publication is missing or its tables differ from the
    /// configured ones.
    pub async fn verify_publication(&self) -> Result<()> {
        match self.publication_tables().await? {
            Some(actual) => check_publication_tables(
                &self.options.publication_name,
                &self.qualified_tables(),
                &actual,
            ),
            None => Err(SyncError::config(format!(
                "Publication '{}' does not exist",
                self.options.publication_name
            ))),
        }
    }

    /// Create the publication if missing, scoped to exactly the configured
    /// tables; otherwise verify the existing one.
    pub async fn ensure_publication(&self) -> Result<()> {
        if self.publication_tables().await?.is_some() {
            return self.verify_publication().await;
        }

        let tables = self
            .options
            .table_names
            .iter()
            .map(|t| format!("{}.{}", quote_ident(&self.options.schema), quote_ident(t)))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "CREATE PUBLICATION {} FOR TABLE {tables}",
            quote_ident(&self.options.publication_name)
        );
        self.pg_client
            .batch_execute(&query)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to create publication"))?;
        info!(
            "Created publication {} for {}",
            self.options.publication_name, tables
        );
        Ok(())
    }

    pub async fn drop_publication(&self) -> Result<()> {
        let query = format!(
            "DROP PUBLICATION IF EXISTS {}",
            quote_ident(&self.options.publication_name)
        );
        self.pg_client
            .batch_execute(&query)
            .await
            .map_err(|e| classify_pg_error(e, "Failed to drop publication"))?;
        info!("Dropped publication {}", self.options.publication_name);
        Ok(())
    }

    /// wal2json `add-tables` filter restricting output to the publication.
    fn add_tables_filter(&self) -> String {
        self.options
            .table_names
            .iter()
            .map(|t| {
                format!(
                    "{}.{}",
                    escape_wal2json_name(&self.options.schema),
                    escape_wal2json_name(t)
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl ChangeFeed for Slot {
    async fn peek(&self, max_changes: usize) -> Result<Vec<WalMessage>> {
        // 'format-version', '2' - one JSON object per change
        // 'include-transaction', 'true' - emit B/C records, C carries the commit position
        // 'include-pk', 'true' - primary key column names for the merge key
        // 'add-tables' - only the tables of the publication
        let query = "SELECT lsn::text, data FROM pg_logical_slot_peek_changes(\
            $1, NULL, $2, \
            'format-version', '2', \
            'include-lsn', 'true', \
            'include-transaction', 'true', \
            'include-pk', 'true', \
            'add-tables', $3)";
        let limit = i32::try_from(max_changes).unwrap_or(i32::MAX);

        let rows = self
            .pg_client
            .query(query, &[&self.options.slot_name, &limit, &self.add_tables_filter()])
            .await
            .map_err(|e| classify_pg_error(e, "Failed to peek changes from replication slot"))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(WalMessage {
                lsn: row.get::<_, String>(0).parse()?,
                data: row.get(1),
            });
        }
        debug!("Peeked {} messages from {}", messages.len(), self.name());
        Ok(messages)
    }

    async fn advance(&self, lsn: Lsn) -> Result<()> {
        self.pg_client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.options.slot_name, &lsn.to_string()],
            )
            .await
            .map_err(|e| classify_pg_error(e, "Failed to advance replication slot"))?;
        debug!("Advanced {} to {}", self.name(), lsn);
        Ok(())
    }
}

/// wal2json requires space, quote, comma, period and asterisk to be escaped
/// in `add-tables` entries.
fn escape_wal2json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, ' ' | '\'' | ',' | '.' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn check_publication_tables(
    publication: &str,
    expected: &BTreeSet<String>,
    actual: &BTreeSet<String>,
) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    let missing: Vec<_> = expected.difference(actual).cloned().collect();
    let extra: Vec<_> = actual.difference(expected).cloned().collect();
    Err(SyncError::config(format!(
        "Publication '{publication}' does not match the configured tables \
         (missing: [{}], unexpected: [{}]); reset the pipeline to recreate it",
        missing.join(", "),
        extra.join(", ")
    )))
}
