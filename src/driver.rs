//! The boundary between the engine and a concrete database client.
//!
//! A [`Driver`] opens [`Link`]s; a link runs statements and hands back either
//! a buffered [`RawResult`] or a plain completion. Everything above this
//! module (connection, cursors, transactions) is driver-agnostic.

use std::fmt;
use std::time::Duration;

use crate::config::{DataSource, TlsOptions};
use crate::results::Field;
use crate::results::Row;

/// MySQL's `ER_LOCK_DEADLOCK`.
pub const MYSQL_DEADLOCK: u32 = 1213;
/// The second MySQL code treated as lock contention.
pub const MYSQL_LOCK_CONTENTION: u32 = 1479;

/// Error state read back from the driver after a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub code: u32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for DriverError {}

/// Session mode set on a link right after it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlMode {
    /// `TRADITIONAL`: invalid data is rejected instead of coerced.
    Traditional,
    /// Empty SQL mode.
    Permissive,
}

impl SqlMode {
    #[must_use]
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            SqlMode::Traditional
        } else {
            SqlMode::Permissive
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SqlMode::Traditional => "TRADITIONAL",
            SqlMode::Permissive => "",
        }
    }

    /// Statement a driver runs on connect to apply this mode.
    #[must_use]
    pub fn init_command(self) -> String {
        format!("SET SESSION sql_mode = '{}'", self.as_str())
    }
}

/// Options applied by the driver while it initializes and connects a link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub sql_mode: SqlMode,
    pub connect_timeout: Duration,
    /// Present only when TLS should be negotiated.
    pub tls: Option<TlsOptions>,
}

impl LinkOptions {
    #[must_use]
    pub fn for_source(source: &DataSource) -> Self {
        Self {
            sql_mode: SqlMode::from_strict(source.strict),
            connect_timeout: source.connect_timeout,
            tls: source.tls.is_enabled().then(|| source.tls.clone()),
        }
    }
}

/// What a statement produced.
pub enum QueryOutcome {
    /// A buffered, row-bearing result.
    Rows(Box<dyn RawResult>),
    /// The statement completed without a result (DDL/DML).
    Done,
}

impl fmt::Debug for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutcome::Rows(raw) => f.debug_tuple("Rows").field(&raw.num_rows()).finish(),
            QueryOutcome::Done => f.write_str("Done"),
        }
    }
}

/// Factory for links to one kind of database.
pub trait Driver: Send + Sync {
    /// Initialize a handle, apply `options`, and connect it.
    ///
    /// # Errors
    /// Returns the driver's connect error.
    fn open(&self, source: &DataSource, options: &LinkOptions)
    -> Result<Box<dyn Link>, DriverError>;

    /// Error codes that mean lock-wait-timeout or deadlock for this driver.
    fn lock_contention_codes(&self) -> &'static [u32] {
        &[MYSQL_DEADLOCK, MYSQL_LOCK_CONTENTION]
    }

    /// Whether the database admits only one writing transaction at a time
    /// across all links, so a second link blocks behind an open write.
    fn single_writer(&self) -> bool {
        false
    }
}

/// A live connection handle.
pub trait Link: Send {
    /// # Errors
    /// Returns the driver error if the charset is rejected.
    fn set_charset(&mut self, charset: &str) -> Result<(), DriverError>;

    /// # Errors
    /// Returns the driver error if the schema switch is rejected.
    fn select_db(&mut self, database: &str) -> Result<(), DriverError>;

    /// Run one statement, buffering any rows it returns.
    ///
    /// # Errors
    /// Returns the driver's error state for the statement.
    fn query(&mut self, sql: &str) -> Result<QueryOutcome, DriverError>;

    /// Escape `value` for inclusion between single quotes.
    fn escape(&self, value: &str) -> String;

    /// Whether a backslash inside a quoted literal escapes the next
    /// character. MySQL does this; standard SQL (SQLite) only doubles quotes.
    fn backslash_escapes(&self) -> bool {
        true
    }

    /// Rows affected by the last statement.
    fn affected_rows(&self) -> u64;

    /// Last auto-increment value generated on this link.
    fn insert_id(&self) -> u64;

    /// Server-side session id.
    fn thread_id(&self) -> u64;

    fn close(&mut self);
}

/// A buffered result handle. Dropping it releases the buffer.
pub trait RawResult: Send {
    /// Row count reported by the server; fixed for the handle's lifetime.
    fn num_rows(&self) -> usize;

    /// Move the fetch pointer to `offset`. Returns false if out of range.
    fn data_seek(&mut self, offset: usize) -> bool;

    /// Fetch the row under the pointer and advance it.
    fn fetch_row(&mut self) -> Option<Row>;

    /// Column metadata for the result.
    fn fields(&self) -> Vec<Field>;
}
