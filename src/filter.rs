//! Interception pipeline wrapped around raw statement execution.
//!
//! Filters run in registration order. Each receives the statement and a
//! [`Next`] handle; calling [`Next::run`] forwards to the following filter
//! and finally to the terminal executor. A filter may skip `run` to answer
//! with its own [`ResultSet`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::results::ResultSet;

/// One wrapping behavior in a [`FilterChain`].
pub trait Filter: Send + Sync {
    /// # Errors
    /// Whatever the rest of the chain returns, unless the filter handles it.
    fn execute(&self, sql: &str, next: &mut Next<'_, '_>) -> Result<ResultSet>;
}

/// Continuation handed to a filter: the remaining filters plus the terminal.
pub struct Next<'a, 't> {
    filters: &'a [Arc<dyn Filter>],
    terminal: &'a mut (dyn FnMut(&str) -> Result<ResultSet> + 't),
}

impl Next<'_, '_> {
    /// Run the remainder of the chain. May be called more than once.
    ///
    /// # Errors
    /// Returns the first error from the remaining filters or the terminal.
    pub fn run(&mut self, sql: &str) -> Result<ResultSet> {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                let mut next = Next {
                    filters: rest,
                    terminal: &mut *self.terminal,
                };
                filter.execute(sql, &mut next)
            }
            None => (self.terminal)(sql),
        }
    }
}

/// Ordered filters applied to every statement a connection runs.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: impl Filter + 'static) -> &mut Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn push_arc(&mut self, filter: Arc<dyn Filter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run `sql` through every filter and then `terminal`.
    ///
    /// # Errors
    /// Returns whatever the outermost filter returns.
    pub fn execute(
        &self,
        sql: &str,
        terminal: &mut dyn FnMut(&str) -> Result<ResultSet>,
    ) -> Result<ResultSet> {
        Next {
            filters: &self.filters,
            terminal,
        }
        .run(sql)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Logs each statement with its elapsed time at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFilter;

impl Filter for TracingFilter {
    fn execute(&self, sql: &str, next: &mut Next<'_, '_>) -> Result<ResultSet> {
        let started = Instant::now();
        let result = next.run(sql);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(rs) => tracing::debug!(sql, elapsed_ms, affected = rs.count(), "statement executed"),
            Err(err) => tracing::debug!(sql, elapsed_ms, error = %err, "statement failed"),
        }
        result
    }
}

/// Re-issues statements that failed with lock contention.
///
/// A deadlock aborts the whole server-side transaction, so this filter
/// belongs on connections running single statements, not multi-statement
/// transactions.
#[derive(Debug, Clone, Copy)]
pub struct RetryFilter {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryFilter {
    /// `max_attempts` counts the first try; values below 1 are treated as 1.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

impl Filter for RetryFilter {
    fn execute(&self, sql: &str, next: &mut Next<'_, '_>) -> Result<ResultSet> {
        let mut attempt = 1;
        loop {
            match next.run(sql) {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        code = ?err.code(),
                        "lock contention, retrying statement"
                    );
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
