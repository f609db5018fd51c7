//! Source-side preflight checks.
//!
//! Failures are configuration errors and are reported before any replication
//! slot is created.

use sync_core::{Result, SyncError};
use tokio_postgres::Client;
use tracing::info;

use crate::classify_pg_error;

/// Verify connectivity and, when `logical_decoding` is set, that the server
/// and the current role can run logical replication.
pub async fn check_source(client: &Client, logical_decoding: bool) -> Result<()> {
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| classify_pg_error(e, "PostgreSQL connectivity check failed"))?;

    if !logical_decoding {
        info!("✓ PostgreSQL connectivity verified");
        return Ok(());
    }

    let row = client
        .query_one("SHOW wal_level", &[])
        .await
        .map_err(|e| classify_pg_error(e, "Failed to read wal_level"))?;
    check_wal_level(row.get::<_, String>(0).as_str())?;

    let role = client
        .query_opt(
            "SELECT rolsuper, rolreplication FROM pg_roles WHERE rolname = current_user",
            &[],
        )
        .await
        .map_err(|e| classify_pg_error(e, "Failed to read role privileges"))?
        .map(|row| (row.get::<_, bool>(0), row.get::<_, bool>(1)));
    check_role(role)?;

    info!("✓ PostgreSQL connectivity and privileges verified");
    Ok(())
}

pub fn check_wal_level(wal_level: &str) -> Result<()> {
    if wal_level.eq_ignore_ascii_case("logical") {
        Ok(())
    } else {
        Err(SyncError::config(format!(
            "wal_level is '{wal_level}', must be 'logical' for logical decoding"
        )))
    }
}

/// `role` is `(rolsuper, rolreplication)` of the current user, if found.
pub fn check_role(role: Option<(bool, bool)>) -> Result<()> {
    match role {
        Some((superuser, replication)) if superuser || replication => Ok(()),
        _ => Err(SyncError::config(
            "Current Postgres role lacks REPLICATION privilege or superuser",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_level() {
        assert!(check_wal_level("logical").is_ok());
        assert!(check_wal_level("LOGICAL").is_ok());

        let err = check_wal_level("replica").unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("wal_level is 'replica'"));
    }

    #[test]
    fn test_role_privileges() {
        assert!(check_role(Some((true, false))).is_ok());
        assert!(check_role(Some((false, true))).is_ok());
        assert!(check_role(Some((false, false))).unwrap_err().is_config());
        assert!(check_role(None).unwrap_err().is_config());
    }
}
