//! Error types for the sync engine.

use std::time::Duration;

use thiserror::Error;

/// Exit code for configuration problems (bad YAML, failed validation).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for source, target or pool connectivity failures.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for a sync pass that finished in the Failed state.
pub const EXIT_SYNC_FAILED: u8 = 3;
/// Exit code for a run interrupted by SIGINT/SIGTERM.
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for file-system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// MongoDB connection, query or change stream error
    #[error("Source database error: {0}")]
    Source(#[from] mongodb::error::Error),

    /// PostgreSQL connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Network or timeout failure that is expected to clear up on retry
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// No warehouse connection became available within the acquire timeout
    #[error("Connection pool exhausted: no connection available after {0:?}")]
    PoolExhausted(Duration),

    /// The pool is closing or has been shut down
    #[error("Connection pool is closed")]
    PoolClosed,

    /// `initialize` was called twice without an intervening shutdown
    #[error("Connection pool is already initialized")]
    PoolAlreadyInitialized,

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A source document is missing a required field
    #[error("Malformed {entity} document {document}: {reason}")]
    MalformedRecord {
        entity: String,
        document: String,
        reason: String,
    },

    /// Opening the change stream failed
    #[error("Change feed subscription failed: {0}")]
    FeedSubscription(String),

    /// Loading a batch into a warehouse table failed
    #[error("Load failed for table {table}: {message}")]
    Load { table: String, message: String },

    /// A sync pass ended in the Failed state
    #[error("Sync pass failed: {0}")]
    PassFailed(String),

    /// The source or the warehouse did not answer a health check
    #[error("Health check failed: {0}")]
    Unhealthy(String),

    /// The change feed listener could not be started or stopped
    #[error("Listener error: {0}")]
    Listener(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (shutdown, SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        SyncError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Load error
    pub fn load(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Load {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a MalformedRecord error
    pub fn malformed(
        entity: impl Into<String>,
        document: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SyncError::MalformedRecord {
            entity: entity.into(),
            document: document.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the failed operation has a reasonable chance to succeed.
    ///
    /// Pool exhaustion and pool closure are deliberately not transient: they
    /// fail the pass, and the next trigger starts fresh.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::TransientIo(_) => true,
            SyncError::Target(e) => is_transient_pg(e),
            SyncError::Source(e) => is_transient_mongo(e),
            SyncError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) | SyncError::Json(_) => EXIT_CONFIG_ERROR,
            SyncError::Source(_)
            | SyncError::Target(_)
            | SyncError::TransientIo(_)
            | SyncError::PoolExhausted(_)
            | SyncError::PoolClosed
            | SyncError::PoolAlreadyInitialized
            | SyncError::Pool { .. }
            | SyncError::FeedSubscription(_)
            | SyncError::Unhealthy(_)
            | SyncError::Listener(_) => EXIT_CONNECTION_ERROR,
            SyncError::MalformedRecord { .. } | SyncError::Load { .. } | SyncError::PassFailed(_) => {
                EXIT_SYNC_FAILED
            }
            SyncError::Cancelled => EXIT_CANCELLED,
            SyncError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

fn is_transient_pg(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    if let Some(code) = e.code() {
        let code = code.code();
        // 08xxx connection exceptions, admin shutdown, serialization failure, deadlock
        return code.starts_with("08") || matches!(code, "57P01" | "40001" | "40P01");
    }
    // No SQLSTATE means the failure happened below the protocol (socket, TLS)
    std::error::Error::source(e)
        .map(|s| s.downcast_ref::<std::io::Error>().is_some())
        .unwrap_or(false)
}

fn is_transient_mongo(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    matches!(
        *e.kind,
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. }
    )
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::TransientIo("connection reset".into()).is_transient());
        assert!(SyncError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_transient());

        assert!(!SyncError::PoolClosed.is_transient());
        assert!(!SyncError::PoolExhausted(Duration::from_secs(1)).is_transient());
        assert!(!SyncError::Config("bad".into()).is_transient());
        assert!(!SyncError::malformed("sale", "v1", "missing _id").is_transient());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(SyncError::PoolClosed.exit_code(), EXIT_CONNECTION_ERROR);
        assert_eq!(SyncError::Unhealthy("x".into()).exit_code(), EXIT_CONNECTION_ERROR);
        assert_eq!(SyncError::PassFailed("x".into()).exit_code(), EXIT_SYNC_FAILED);
        assert_eq!(SyncError::load("ventas", "x").exit_code(), EXIT_SYNC_FAILED);
        assert_eq!(SyncError::Cancelled.exit_code(), EXIT_CANCELLED);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(SyncError::Io(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.yaml");
        let err = SyncError::Io(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: config.yaml"));
    }

    #[test]
    fn test_pool_error_carries_context() {
        let err = SyncError::pool("timed out", "acquiring warehouse connection");
        let text = err.to_string();
        assert!(text.contains("timed out"));
        assert!(text.contains("acquiring warehouse connection"));
    }
}
