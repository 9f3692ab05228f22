//! Convenient imports for common functionality.
//!
//! This module re-exports the types most callers need to open a
//! connection, run statements and read results.

pub use crate::config::{DataSource, DataSourceBuilder, TlsOptions};
pub use crate::connection::Connection;
pub use crate::conversion::{DateConverter, JsonConverter, TypeConverter};
pub use crate::driver::{Driver, Link, QueryOutcome, RawResult};
pub use crate::error::DbError;
pub use crate::events::{Corkable, EventBus, Subscriber, WILDCARD};
pub use crate::filter::{Filter, FilterChain, Next, RetryFilter, TracingFilter};
pub use crate::instrument::{Instrumentation, QueryLog, QueryLogEntry};
pub use crate::results::{
    Converting, Field, Fields, FnHydrator, RawRows, ResultCursor, ResultSet, Row, RowHydrator,
    Typed,
};
pub use crate::sequence::SequencePool;
pub use crate::transaction::{Transaction, TransactionState};
pub use crate::types::{ColumnRef, Params, Value};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::SqliteDriver;
