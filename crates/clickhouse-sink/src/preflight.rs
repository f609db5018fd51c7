//! Destination checks run before any pipeline touches replication state.

use sync_core::{Result, SyncError};
use tracing::info;

use crate::schema::qualified_name;
use crate::warehouse::classify_clickhouse_error;
use crate::ClickHouseWarehouse;

const PERMISSION_CHECK_TABLE: &str = "_permcheck";

impl ClickHouseWarehouse {
    /// Verify connectivity, the target database and write privileges.
    ///
    /// Anything other than an unreachable server is reported as a
    /// configuration error.
    pub async fn preflight(&self) -> Result<()> {
        let client = self.client();

        client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| classify_clickhouse_error(e, "ClickHouse is not reachable"))?;
        info!("✓ ClickHouse connection");

        let exists = client
            .query("EXISTS DATABASE ?")
            .bind(clickhouse::sql::Identifier(self.database()))
            .fetch_one::<u8>()
            .await
            .map_err(|e| as_config(e, "Failed to check destination database"))?;
        if exists == 0 {
            return Err(SyncError::config(format!(
                "Destination database '{}' does not exist",
                self.database()
            )));
        }
        info!("✓ Database {} exists", self.database());

        let table = qualified_name(self.database(), PERMISSION_CHECK_TABLE);
        for sql in [
            format!("CREATE TABLE IF NOT EXISTS {table} (id UInt8) ENGINE = Memory"),
            format!("INSERT INTO {table} VALUES (1)"),
            format!("DROP TABLE IF EXISTS {table}"),
        ] {
            client
                .query(&sql)
                .execute()
                .await
                .map_err(|e| as_config(e, "Missing write privileges on the destination database"))?;
        }
        info!("✓ Create, insert and drop privileges");

        let granted = client
            .query("CHECK GRANT SELECT ON INFORMATION_SCHEMA.*")
            .fetch_one::<u8>()
            .await
            .map_err(|e| as_config(e, "Failed to check INFORMATION_SCHEMA grant"))?;
        if granted == 0 {
            return Err(SyncError::config(
                "Destination user lacks SELECT on INFORMATION_SCHEMA",
            ));
        }
        info!("✓ INFORMATION_SCHEMA access");

        Ok(())
    }
}

fn as_config(err: clickhouse::error::Error, context: &str) -> SyncError {
    match classify_clickhouse_error(err, context) {
        SyncError::Destination { context, source } => {
            SyncError::config(format!("{context}: {source}"))
        }
        other => other,
    }
}
