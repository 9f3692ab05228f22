//! Diagnostic counters and query logs. Nothing here affects control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

static QUERY_COUNT: AtomicU64 = AtomicU64::new(0);

/// Statements executed by every connection in this process.
#[must_use]
pub fn query_count() -> u64 {
    QUERY_COUNT.load(Ordering::Relaxed)
}

pub(crate) fn count_query() {
    QUERY_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// One executed statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogEntry {
    pub sql: String,
    /// Session id of the link the statement ran on.
    pub connection_id: u64,
    pub elapsed_millis: f64,
    /// Rows returned by a query; 0 for DML and failed statements.
    pub rows: u64,
}

/// Receives a record for every statement a connection executes.
pub trait Instrumentation: Send + Sync {
    fn record_query(&self, entry: QueryLogEntry);
}

/// In-memory [`Instrumentation`] sink that keeps every entry.
#[derive(Debug, Default)]
pub struct QueryLog {
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<QueryLogEntry>,
    total_millis: f64,
}

impl QueryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.state().entries.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of elapsed time across all entries.
    #[must_use]
    pub fn total_time(&self) -> Duration {
        Duration::from_secs_f64(self.state().total_millis.max(0.0) / 1000.0)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.total_millis = 0.0;
    }

    /// The log as a JSON array, for dumping diagnostics.
    ///
    /// # Errors
    /// Returns the serializer error.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.state().entries)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Instrumentation for QueryLog {
    fn record_query(&self, entry: QueryLogEntry) {
        let mut state = self.state();
        state.total_millis += entry.elapsed_millis;
        state.entries.push(entry);
    }
}
