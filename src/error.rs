use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by connections, cursors, transactions and the event bus.
///
/// Statement failures are split in two: [`DbError::Deadlock`] for lock
/// contention codes (safe to re-issue) and [`DbError::Database`] for
/// everything else. Callers implementing retry-on-contention should match on
/// the former or use [`DbError::is_retryable`].
#[derive(Debug, Error)]
pub enum DbError {
    /// The link could not be established or configured.
    #[error("Connection error ({code}): {message}")]
    Connection { code: u32, message: String },

    /// A statement failed for a reason other than lock contention.
    #[error("Database error ({code}): {message}")]
    Database { code: u32, message: String },

    /// A statement failed with a lock-wait-timeout or deadlock code.
    #[error("Deadlock ({code}): {message}")]
    Deadlock { code: u32, message: String },

    /// Cursor seek outside of `[0, count)`.
    #[error("Unable to seek to offset {position} (result has {count} rows)")]
    Range { position: i64, count: usize },

    /// Illegal transaction or result-set state transition.
    #[error("Illegal state: {0}")]
    State(String),

    /// Mutation attempted on a read-only result view.
    #[error("Immutability violation: {0}")]
    Immutable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parameter binding error: {0}")]
    Parameter(String),

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl DbError {
    pub fn connection(code: u32, message: impl Into<String>) -> Self {
        DbError::Connection {
            code,
            message: message.into(),
        }
    }

    pub fn database(code: u32, message: impl Into<String>) -> Self {
        DbError::Database {
            code,
            message: message.into(),
        }
    }

    pub fn deadlock(code: u32, message: impl Into<String>) -> Self {
        DbError::Deadlock {
            code,
            message: message.into(),
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        DbError::State(message.into())
    }

    /// Driver error code, when the failure came from the driver.
    #[must_use]
    pub fn code(&self) -> Option<u32> {
        match self {
            DbError::Connection { code, .. }
            | DbError::Database { code, .. }
            | DbError::Deadlock { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Only lock contention is worth re-issuing.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Deadlock { .. })
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Conversion(format!("JSON hydration failed: {err}"))
    }
}
