//! Error taxonomy shared across the sync crates.
//!
//! Every failure that crosses a crate boundary is classified so the
//! orchestrator can decide whether to retry, skip or fail the run:
//!
//! | Variant | Handling |
//! |---------|----------|
//! | `Config` | fatal, reported before replication state is touched |
//! | `Connection` | retried with backoff while streaming, otherwise fails the run |
//! | `Query` | fatal to the run |
//! | `Data` | logged by callers, offending row dropped |
//! | `Replication` | fatal to the run (slot/publication protocol violations) |
//! | `Destination` | fatal to the run |

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used by the library crates.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Invalid configuration, missing privileges or misconfigured servers.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A source or destination could not be reached, or dropped the connection.
    #[error("Connection error: {context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A statement was rejected by the source.
    #[error("Query error: {context}: {source}")]
    Query {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A row or payload did not have the expected shape.
    #[error("Data error: {0}")]
    Data(String),

    /// The replication slot or its decoded output misbehaved.
    #[error("Replication error: {0}")]
    Replication(String),

    /// The destination rejected a write or a query.
    #[error("Destination error: {context}: {source}")]
    Destination {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        SyncError::Data(msg.into())
    }

    pub fn replication(msg: impl Into<String>) -> Self {
        SyncError::Replication(msg.into())
    }

    /// Whether a reconnect-and-resume may clear the error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }
}

/// Attach a classification and context message to a foreign error,
/// mirroring `anyhow::Context` but producing a [`SyncError`].
pub trait ErrorContext<T> {
    fn connection_context(self, context: impl Into<String>) -> Result<T>;
    fn query_context(self, context: impl Into<String>) -> Result<T>;
    fn destination_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn connection_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SyncError::Connection {
            context: context.into(),
            source: Box::new(e),
        })
    }

    fn query_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SyncError::Query {
            context: context.into(),
            source: Box::new(e),
        })
    }

    fn destination_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| SyncError::Destination {
            context: context.into(),
            source: Box::new(e),
        })
    }
}
