use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::binder::Binder;
use crate::config::DataSource;
use crate::driver::{Driver, DriverError, Link, LinkOptions, QueryOutcome};
use crate::error::{DbError, Result};
use crate::filter::{Filter, FilterChain};
use crate::instrument::{self, Instrumentation, QueryLogEntry};
use crate::results::ResultSet;
use crate::sequence::{SINGLE_WRITER_LOCK_WAIT, SequencePool};
use crate::transaction::Transaction;
use crate::types::Params;

/// A lazily opened link to one data source.
///
/// The link is created on first use and replaced by [`Connection::connect`].
/// Statements run through the connection's [`FilterChain`]. A connection is
/// meant for one thread at a time; open one per worker for concurrency.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sql_link::prelude::*;
///
/// # fn main() -> Result<(), DbError> {
/// let source = DataSource::builder("localhost").database("app.db").build()?;
/// let mut conn = Connection::new(source, Arc::new(SqliteDriver));
/// let mut rs = conn.execute("SELECT id, name FROM t WHERE id > ?", [3])?;
/// while let Some(row) = rs.row()? {
///     println!("{:?}", row.get("name"));
/// }
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    source: DataSource,
    driver: Arc<dyn Driver>,
    link: Option<Box<dyn Link>>,
    filters: FilterChain,
    selected_database: Option<String>,
    sequence_pool: Option<Box<SequencePool>>,
    instrumentation: Option<Arc<dyn Instrumentation>>,
    retryable_codes: Vec<u32>,
}

impl Connection {
    /// Describe a connection. No link is opened until it is needed.
    pub fn new(source: DataSource, driver: Arc<dyn Driver>) -> Self {
        let retryable_codes = source
            .retryable_codes
            .clone()
            .unwrap_or_else(|| driver.lock_contention_codes().to_vec());
        Self {
            selected_database: source.database.clone(),
            source,
            driver,
            link: None,
            filters: FilterChain::new(),
            sequence_pool: None,
            instrumentation: None,
            retryable_codes,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn with_instrumentation(mut self, sink: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = Some(sink);
        self
    }

    pub fn filters_mut(&mut self) -> &mut FilterChain {
        &mut self.filters
    }

    #[must_use]
    pub fn source(&self) -> &DataSource {
        &self.source
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Whether the driver admits one writing transaction at a time.
    #[must_use]
    pub fn single_writer(&self) -> bool {
        self.driver.single_writer()
    }

    /// Codes classified as [`DbError::Deadlock`].
    #[must_use]
    pub fn retryable_codes(&self) -> &[u32] {
        &self.retryable_codes
    }

    /// Discard any existing link and open a fresh one.
    ///
    /// A database picked with [`Connection::select_database`] is selected
    /// again on the new link.
    ///
    /// # Errors
    /// `DbError::Connection` if the link cannot be opened or configured;
    /// `DbError::Database` if re-selecting the database fails.
    pub fn connect(&mut self) -> Result<()> {
        self.discard_link();
        let mut link = self.open_link()?;

        if let Some(database) = &self.selected_database {
            if self.source.database.as_ref() != Some(database) {
                if let Err(err) = link.select_db(database) {
                    link.close();
                    return Err(DbError::database(err.code, err.message));
                }
            }
        }
        self.link = Some(link);
        Ok(())
    }

    /// The live link, opening it first if needed.
    ///
    /// # Errors
    /// `DbError::Connection` if a link has to be opened and cannot be.
    pub fn ensure_open(&mut self) -> Result<&mut (dyn Link + 'static)> {
        if self.link.is_none() {
            self.connect()?;
        }
        self.link
            .as_deref_mut()
            .ok_or_else(|| DbError::connection(0, "link unavailable after connect"))
    }

    fn open_link(&self) -> Result<Box<dyn Link>> {
        self.source.validate()?;
        let options = LinkOptions::for_source(&self.source);
        let mut link = self
            .driver
            .open(&self.source, &options)
            .map_err(|err| DbError::connection(err.code, err.message))?;

        if let Err(err) = link.set_charset(&self.source.charset) {
            link.close();
            return Err(DbError::connection(
                err.code,
                format!(
                    "Error setting character set to {}: {}",
                    self.source.charset, err.message
                ),
            ));
        }

        tracing::debug!(
            host = %self.source.host,
            port = self.source.port,
            thread_id = link.thread_id(),
            sql_mode = options.sql_mode.as_str(),
            tls = options.tls.is_some(),
            "link opened"
        );
        Ok(link)
    }

    fn discard_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            tracing::debug!(thread_id = link.thread_id(), "link closed");
            link.close();
        }
    }

    /// Switch the active schema on the link.
    ///
    /// # Errors
    /// `DbError::Database` with the driver's code if the switch is rejected.
    pub fn select_database(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?
            .select_db(name)
            .map_err(|err| DbError::database(err.code, err.message))?;
        tracing::debug!(database = name, "database selected");
        self.selected_database = Some(name.to_string());
        Ok(())
    }

    #[must_use]
    pub fn selected_database(&self) -> Option<&str> {
        self.selected_database.as_deref()
    }

    #[must_use]
    pub fn charset(&self) -> &str {
        &self.source.charset
    }

    /// Session id of the live link.
    #[must_use]
    pub fn thread_id(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.thread_id())
    }

    /// Run one statement through the filter chain.
    ///
    /// `params` is bound into `sql` when non-empty. Lock-contention failures
    /// come back as [`DbError::Deadlock`], every other failure as
    /// [`DbError::Database`].
    ///
    /// # Errors
    /// Connection, binding and statement errors.
    pub fn execute<P: Into<Params>>(&mut self, sql: &str, params: P) -> Result<ResultSet> {
        let params = params.into();
        self.ensure_open()?;

        let Self {
            link,
            filters,
            instrumentation,
            retryable_codes,
            ..
        } = self;
        let link = link
            .as_deref_mut()
            .ok_or_else(|| DbError::connection(0, "link unavailable"))?;

        let sql: Cow<'_, str> = if params.is_empty() {
            Cow::Borrowed(sql)
        } else {
            Cow::Owned(Binder::new(&*link).bind(sql, &params)?)
        };

        let retryable_codes: &[u32] = retryable_codes;
        let instrumentation = instrumentation.as_deref();
        filters.execute(&sql, &mut |sql: &str| {
            run_raw(link, sql, retryable_codes, instrumentation)
        })
    }

    /// A new transaction on this connection, not yet begun.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// A new transaction with `callback` queued to run after commit.
    pub fn transaction_with<'c, F>(&'c mut self, callback: F) -> Transaction<'c>
    where
        F: FnOnce(&mut Connection) -> Result<()> + 'c,
    {
        let mut tx = Transaction::new(self);
        tx.queue_callback(Box::new(callback));
        tx
    }

    /// A parameter binder using the live link's escaping.
    ///
    /// # Errors
    /// `DbError::Connection` if the link cannot be opened.
    pub fn binder(&mut self) -> Result<Binder<'_>> {
        let link = self.ensure_open()?;
        Ok(Binder::new(link))
    }

    /// The sequence pool, created on first call with its own connection to
    /// the same data source.
    ///
    /// On a single-writer database the pool's lock wait is capped at
    /// [`SINGLE_WRITER_LOCK_WAIT`].
    pub fn sequence_pool(&mut self) -> &mut SequencePool {
        let source = &self.source;
        let driver = &self.driver;
        let instrumentation = &self.instrumentation;
        self.sequence_pool.get_or_insert_with(|| {
            let mut source = source.clone();
            if driver.single_writer() {
                source.connect_timeout = source.connect_timeout.min(SINGLE_WRITER_LOCK_WAIT);
            }
            let mut connection = Connection::new(source, Arc::clone(driver));
            connection.instrumentation = instrumentation.clone();
            Box::new(SequencePool::new(connection))
        })
    }

    /// Release the link and the sequence pool's connection. Safe to call
    /// when nothing was ever opened.
    pub fn close(&mut self) {
        self.discard_link();
        if let Some(mut pool) = self.sequence_pool.take() {
            pool.close();
        }
    }
}

fn run_raw(
    link: &mut dyn Link,
    sql: &str,
    retryable_codes: &[u32],
    instrumentation: Option<&dyn Instrumentation>,
) -> Result<ResultSet> {
    instrument::count_query();
    let started = Instant::now();
    let outcome = link.query(sql);

    if let Some(sink) = instrumentation {
        // failed statements are logged too
        let rows = match &outcome {
            Ok(QueryOutcome::Rows(raw)) => raw.num_rows() as u64,
            Ok(QueryOutcome::Done) | Err(_) => 0,
        };
        sink.record_query(QueryLogEntry {
            sql: sql.to_string(),
            connection_id: link.thread_id(),
            elapsed_millis: started.elapsed().as_secs_f64() * 1000.0,
            rows,
        });
    }

    let raw = match outcome.map_err(|err| classify(err, retryable_codes))? {
        QueryOutcome::Rows(raw) => Some(raw),
        QueryOutcome::Done => None,
    };
    Ok(ResultSet::new(raw, link.affected_rows(), link.insert_id()))
}

fn classify(err: DriverError, retryable_codes: &[u32]) -> DbError {
    if retryable_codes.contains(&err.code) {
        DbError::deadlock(err.code, err.message)
    } else {
        DbError::database(err.code, err.message)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.source.host)
            .field("selected_database", &self.selected_database)
            .field("connected", &self.link.is_some())
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MYSQL_DEADLOCK, MYSQL_LOCK_CONTENTION};
    use crate::instrument::QueryLog;
    use crate::test_utils::{Response, ScriptedDriver};
    use crate::types::Value;

    fn connection(driver: &ScriptedDriver) -> Connection {
        let source = DataSource::builder("db")
            .database("app")
            .strict(true)
            .build()
            .expect("valid source");
        Connection::new(source, Arc::new(driver.clone()))
    }

    #[test]
    fn link_opens_lazily_on_first_statement() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        assert!(!conn.is_connected());
        assert_eq!(driver.opens(), 0);

        conn.execute("SELECT 1", ())?;
        conn.execute("SELECT 2", ())?;
        assert_eq!(driver.opens(), 1);
        assert_eq!(driver.charsets(), vec!["utf8"]);
        let options = driver.last_options().expect("options recorded");
        assert_eq!(options.sql_mode.as_str(), "TRADITIONAL");
        Ok(())
    }

    #[test]
    fn connect_replaces_the_link() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        conn.connect()?;
        let first = conn.thread_id();
        conn.connect()?;
        assert_ne!(conn.thread_id(), first);
        assert_eq!(driver.opens(), 2);
        assert_eq!(driver.closes(), 1);
        Ok(())
    }

    #[test]
    fn connect_failures_are_connection_errors() {
        let driver = ScriptedDriver::new();
        driver.fail_connect(2002, "Can't connect to MySQL server");
        let mut conn = connection(&driver);
        assert!(matches!(
            conn.execute("SELECT 1", ()),
            Err(DbError::Connection { code: 2002, .. })
        ));
        assert!(!conn.is_connected());
    }

    #[test]
    fn charset_failure_closes_link_and_reports() {
        let driver = ScriptedDriver::new();
        driver.fail_charset(2019, "Can't initialize character set");
        let mut conn = connection(&driver);
        let err = conn.connect().expect_err("charset rejected");
        assert!(err.to_string().contains("Error setting character set to utf8"));
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn lock_contention_codes_become_deadlocks() {
        let driver = ScriptedDriver::new();
        driver
            .on("UPDATE a", Response::error(MYSQL_DEADLOCK, "Deadlock found"))
            .on("UPDATE b", Response::error(MYSQL_LOCK_CONTENTION, "lock wait"))
            .on("UPDATE c", Response::error(1146, "Table doesn't exist"));
        let mut conn = connection(&driver);
        assert!(matches!(conn.execute("UPDATE a", ()), Err(DbError::Deadlock { code: 1213, .. })));
        assert!(matches!(conn.execute("UPDATE b", ()), Err(DbError::Deadlock { code: 1479, .. })));
        assert!(matches!(conn.execute("UPDATE c", ()), Err(DbError::Database { code: 1146, .. })));
    }

    #[test]
    fn retryable_codes_can_be_overridden() {
        let driver = ScriptedDriver::new();
        driver.on("UPDATE a", Response::error(1205, "Lock wait timeout"));
        let source = DataSource::builder("db")
            .retryable_codes([1205])
            .build()
            .expect("valid source");
        let mut conn = Connection::new(source, Arc::new(driver.clone()));
        assert_eq!(conn.retryable_codes(), &[1205]);
        assert!(matches!(conn.execute("UPDATE a", ()), Err(DbError::Deadlock { code: 1205, .. })));
    }

    #[test]
    fn params_are_bound_before_execution() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        conn.execute("SELECT * FROM t WHERE id > ? AND name = ?", vec![
            Value::Int(3),
            Value::from("it's"),
        ])?;
        assert_eq!(
            driver.statements().last().map(String::as_str),
            Some("SELECT * FROM t WHERE id > 3 AND name = 'it\\'s'")
        );
        Ok(())
    }

    #[test]
    fn results_capture_affected_rows_and_insert_id() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver.on("INSERT INTO t VALUES (1)", Response::insert(1, 42));
        let mut conn = connection(&driver);
        let rs = conn.execute("INSERT INTO t VALUES (1)", ())?;
        conn.execute("SELECT 1", ())?;
        assert_eq!(rs.count(), 1);
        assert_eq!(rs.last_insert_id(), 42);
        assert!(!rs.has_rows());
        Ok(())
    }

    #[test]
    fn select_database_updates_state_or_fails() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver.known_databases(["app", "reports"]);
        let mut conn = connection(&driver);
        assert_eq!(conn.selected_database(), Some("app"));
        conn.select_database("reports")?;
        assert_eq!(conn.selected_database(), Some("reports"));
        assert!(matches!(
            conn.select_database("missing"),
            Err(DbError::Database { code: 1049, .. })
        ));
        assert_eq!(conn.selected_database(), Some("reports"));

        driver.clear_statements();
        conn.connect()?;
        assert_eq!(driver.statements(), vec!["USE reports"]);
        Ok(())
    }

    #[test]
    fn instrumentation_records_each_statement() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver
            .on("DELETE FROM t", Response::done(5))
            .on(
                "SELECT id FROM t",
                Response::rows(&["id"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]),
            );
        let log = Arc::new(QueryLog::new());
        let mut conn = connection(&driver).with_instrumentation(log.clone());
        let before = instrument::query_count();
        conn.execute("DELETE FROM t", ())?;
        conn.execute("SELECT id FROM t", ())?;
        assert!(instrument::query_count() > before);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rows, 0);
        assert_eq!(entries[1].rows, 2);
        assert_eq!(Some(entries[0].connection_id), conn.thread_id());
        Ok(())
    }

    #[test]
    fn failed_statements_are_still_logged() {
        let driver = ScriptedDriver::new();
        driver.on("SELEC 1", Response::error(1064, "You have an error in your SQL syntax"));
        let log = Arc::new(QueryLog::new());
        let mut conn = connection(&driver).with_instrumentation(log.clone());
        assert!(matches!(
            conn.execute("SELEC 1", ()),
            Err(DbError::Database { code: 1064, .. })
        ));
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sql, "SELEC 1");
        assert_eq!(entries[0].rows, 0);
    }

    #[test]
    fn close_is_safe_without_a_link_and_releases_everything() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut conn = connection(&driver);
        conn.close();
        assert_eq!(driver.closes(), 0);

        conn.execute("SELECT 1", ())?;
        conn.sequence_pool().current("orders")?;
        assert_eq!(driver.opens(), 2);
        conn.close();
        assert_eq!(driver.closes(), 2);
        assert!(!conn.is_connected());
        Ok(())
    }
}
