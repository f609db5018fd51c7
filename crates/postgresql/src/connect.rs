use sync_core::{Result, SyncError};
use tokio_postgres::{Client, NoTls};
use tracing::error;

/// Connect to PostgreSQL and spawn the connection handler.
///
/// Fails with a connection error if the server is unreachable or rejects
/// the credentials.
pub async fn connect(connection_string: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .map_err(|e| classify_pg_error(e, "Failed to connect to PostgreSQL"))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}

/// Server-side errors (syntax, permissions, missing relations) are query
/// errors; everything else means the connection itself is gone.
pub fn classify_pg_error(err: tokio_postgres::Error, context: &str) -> SyncError {
    if err.as_db_error().is_some() {
        SyncError::Query {
            context: context.to_string(),
            source: Box::new(err),
        }
    } else {
        SyncError::Connection {
            context: context.to_string(),
            source: Box::new(err),
        }
    }
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
