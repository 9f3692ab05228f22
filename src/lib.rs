//! Database access core: lazily opened connections, filtered statement
//! execution, seekable result cursors, transactions with post-commit
//! callbacks, an isolated sequence pool, and a corkable event bus.
//!
//! Everything is synchronous. A [`Connection`] owns at most one link to the
//! database and is used from one thread at a time.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sql_link::prelude::*;
//!
//! # fn main() -> Result<(), DbError> {
//! let source = DataSource::builder("localhost").database("shop.db").build()?;
//! let mut conn = Connection::new(source, Arc::new(SqliteDriver)).with_filter(TracingFilter);
//!
//! let order_id = conn.sequence_pool().next("orders")?;
//! conn.transaction().run(|tx| {
//!     tx.execute("INSERT INTO orders (id, total) VALUES (?, ?)", vec![
//!         Value::from(order_id as i64),
//!         Value::Float(12.5),
//!     ])?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod config;
pub mod connection;
pub mod conversion;
pub mod driver;
pub mod error;
pub mod events;
pub mod filter;
pub mod instrument;
pub mod prelude;
pub mod results;
pub mod sequence;
pub mod transaction;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use binder::Binder;
pub use config::{DataSource, DataSourceBuilder, TlsOptions};
pub use connection::Connection;
pub use driver::{Driver, DriverError, Link, LinkOptions, QueryOutcome, RawResult, SqlMode};
pub use error::{DbError, Result};
pub use events::{Corkable, EventBus, Subscriber};
pub use filter::{Filter, FilterChain, Next, RetryFilter, TracingFilter};
pub use instrument::{Instrumentation, QueryLog, QueryLogEntry, query_count};
pub use results::{ResultCursor, ResultSet, Row, RowHydrator};
pub use sequence::SequencePool;
pub use transaction::{Transaction, TransactionState};
pub use types::{ColumnRef, Params, Value};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;
