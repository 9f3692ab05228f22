//! A programmable in-memory driver for tests.
//!
//! [`ScriptedDriver`] records every statement its links run and answers
//! from a script: responses keyed by exact SQL text, then a FIFO queue,
//! then a plain completion. All links opened from one driver share the
//! script, so tests can inspect what a connection did after the fact.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DataSource;
use crate::driver::{Driver, DriverError, Link, LinkOptions, QueryOutcome};
use crate::results::BufferedResult;
use crate::types::Value;

/// `CR_SERVER_GONE_ERROR`, returned by a closed link.
pub const SERVER_GONE: u32 = 2006;

/// What a scripted link answers for one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Done {
        affected: u64,
        insert_id: u64,
    },
    Error(DriverError),
}

impl Response {
    pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Response::Rows {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows,
        }
    }

    #[must_use]
    pub fn done(affected: u64) -> Self {
        Response::Done {
            affected,
            insert_id: 0,
        }
    }

    #[must_use]
    pub fn insert(affected: u64, insert_id: u64) -> Self {
        Response::Done {
            affected,
            insert_id,
        }
    }

    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Response::Error(DriverError::new(code, message))
    }
}

#[derive(Debug, Default)]
struct Script {
    statements: Vec<String>,
    by_sql: HashMap<String, VecDeque<Response>>,
    queue: VecDeque<Response>,
    opens: u64,
    closes: u64,
    charsets: Vec<String>,
    options: Vec<LinkOptions>,
    known_databases: Option<HashSet<String>>,
    fail_connect: Option<DriverError>,
    fail_charset: Option<DriverError>,
}

impl Script {
    fn respond(&mut self, sql: &str) -> Response {
        if let Some(responses) = self.by_sql.get_mut(sql) {
            // the last response for a statement is sticky
            let response = if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            };
            if let Some(response) = response {
                return response;
            }
        }
        self.queue.pop_front().unwrap_or(Response::done(0))
    }
}

fn lock(state: &Mutex<Script>) -> MutexGuard<'_, Script> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Driver whose links answer from a shared script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<Script>>,
    lock_codes: Option<&'static [u32]>,
    single_writer: bool,
}

impl ScriptedDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `codes` as this driver's lock-contention codes.
    #[must_use]
    pub fn with_lock_codes(mut self, codes: &'static [u32]) -> Self {
        self.lock_codes = Some(codes);
        self
    }

    /// Report the database as admitting one writer at a time.
    #[must_use]
    pub fn with_single_writer(mut self) -> Self {
        self.single_writer = true;
        self
    }

    /// Answer `sql` with `response`. Several responses for the same
    /// statement are served in order; the last one repeats.
    pub fn on(&self, sql: impl Into<String>, response: Response) -> &Self {
        lock(&self.state)
            .by_sql
            .entry(sql.into())
            .or_default()
            .push_back(response);
        self
    }

    /// Queue a response for the next statement with no keyed response.
    pub fn push(&self, response: Response) -> &Self {
        lock(&self.state).queue.push_back(response);
        self
    }

    /// Make every following `open` fail.
    pub fn fail_connect(&self, code: u32, message: impl Into<String>) {
        lock(&self.state).fail_connect = Some(DriverError::new(code, message));
    }

    /// Make every following charset change fail.
    pub fn fail_charset(&self, code: u32, message: impl Into<String>) {
        lock(&self.state).fail_charset = Some(DriverError::new(code, message));
    }

    /// Restrict `select_db` to these schema names.
    pub fn known_databases<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state).known_databases = Some(names.into_iter().map(Into::into).collect());
    }

    /// Every statement run so far, across all links, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).statements.clone()
    }

    pub fn clear_statements(&self) {
        lock(&self.state).statements.clear();
    }

    #[must_use]
    pub fn opens(&self) -> u64 {
        lock(&self.state).opens
    }

    #[must_use]
    pub fn closes(&self) -> u64 {
        lock(&self.state).closes
    }

    #[must_use]
    pub fn charsets(&self) -> Vec<String> {
        lock(&self.state).charsets.clone()
    }

    /// Options passed to the most recent `open`.
    #[must_use]
    pub fn last_options(&self) -> Option<LinkOptions> {
        lock(&self.state).options.last().cloned()
    }
}

impl Driver for ScriptedDriver {
    fn open(
        &self,
        _source: &DataSource,
        options: &LinkOptions,
    ) -> Result<Box<dyn Link>, DriverError> {
        let mut script = lock(&self.state);
        script.options.push(options.clone());
        if let Some(err) = script.fail_connect.clone() {
            return Err(err);
        }
        script.opens += 1;
        Ok(Box::new(ScriptedLink {
            state: Arc::clone(&self.state),
            thread_id: script.opens,
            affected: 0,
            insert_id: 0,
            closed: false,
            standard_strings: false,
        }))
    }

    fn lock_contention_codes(&self) -> &'static [u32] {
        self.lock_codes
            .unwrap_or(&[crate::driver::MYSQL_DEADLOCK, crate::driver::MYSQL_LOCK_CONTENTION])
    }

    fn single_writer(&self) -> bool {
        self.single_writer
    }
}

/// A link opened by [`ScriptedDriver`].
#[derive(Debug)]
pub struct ScriptedLink {
    state: Arc<Mutex<Script>>,
    thread_id: u64,
    affected: u64,
    insert_id: u64,
    closed: bool,
    standard_strings: bool,
}

impl ScriptedLink {
    /// A link with its own empty script, for code that only needs escaping.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            state: Arc::default(),
            thread_id: 0,
            affected: 0,
            insert_id: 0,
            closed: false,
            standard_strings: false,
        }
    }

    /// A detached link that follows standard SQL string rules: quotes are
    /// doubled and backslashes are ordinary characters.
    #[must_use]
    pub fn standard_strings() -> Self {
        Self {
            standard_strings: true,
            ..Self::detached()
        }
    }

    fn gone(&self) -> Result<(), DriverError> {
        if self.closed {
            Err(DriverError::new(SERVER_GONE, "MySQL server has gone away"))
        } else {
            Ok(())
        }
    }
}

impl Link for ScriptedLink {
    fn set_charset(&mut self, charset: &str) -> Result<(), DriverError> {
        self.gone()?;
        let mut script = lock(&self.state);
        if let Some(err) = script.fail_charset.clone() {
            return Err(err);
        }
        script.charsets.push(charset.to_string());
        Ok(())
    }

    fn select_db(&mut self, database: &str) -> Result<(), DriverError> {
        self.gone()?;
        let mut script = lock(&self.state);
        script.statements.push(format!("USE {database}"));
        match &script.known_databases {
            Some(known) if !known.contains(database) => Err(DriverError::new(
                1049,
                format!("Unknown database '{database}'"),
            )),
            _ => Ok(()),
        }
    }

    fn query(&mut self, sql: &str) -> Result<QueryOutcome, DriverError> {
        self.gone()?;
        let response = {
            let mut script = lock(&self.state);
            script.statements.push(sql.to_string());
            script.respond(sql)
        };
        match response {
            Response::Rows { columns, rows } => {
                self.affected = rows.len() as u64;
                let names: Vec<&str> = columns.iter().map(String::as_str).collect();
                Ok(QueryOutcome::Rows(Box::new(BufferedResult::with_columns(
                    &names, rows,
                ))))
            }
            Response::Done {
                affected,
                insert_id,
            } => {
                self.affected = affected;
                self.insert_id = insert_id;
                Ok(QueryOutcome::Done)
            }
            Response::Error(err) => Err(err),
        }
    }

    fn escape(&self, value: &str) -> String {
        if self.standard_strings {
            return value.replace('\'', "''");
        }
        let mut escaped = String::with_capacity(value.len());
        for ch in value.chars() {
            match ch {
                '\0' => escaped.push_str("\\0"),
                '\n' => escaped.push_str("\\n"),
                '\r' => escaped.push_str("\\r"),
                '\x1a' => escaped.push_str("\\Z"),
                '\\' | '\'' | '"' => {
                    escaped.push('\\');
                    escaped.push(ch);
                }
                _ => escaped.push(ch),
            }
        }
        escaped
    }

    fn backslash_escapes(&self) -> bool {
        !self.standard_strings
    }

    fn affected_rows(&self) -> u64 {
        self.affected
    }

    fn insert_id(&self) -> u64 {
        self.insert_id
    }

    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.state).closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(driver: &ScriptedDriver) -> Box<dyn Link> {
        let source = DataSource::default();
        driver
            .open(&source, &LinkOptions::for_source(&source))
            .expect("scripted open")
    }

    #[test]
    fn keyed_responses_repeat_their_last_entry() {
        let driver = ScriptedDriver::new();
        driver
            .on("SELECT 1", Response::done(1))
            .on("SELECT 1", Response::done(2));
        let mut link = open(&driver);
        for expected in [1, 2, 2] {
            link.query("SELECT 1").expect("query");
            assert_eq!(link.affected_rows(), expected);
        }
    }

    #[test]
    fn queue_serves_unkeyed_statements_once() {
        let driver = ScriptedDriver::new();
        driver.push(Response::error(1064, "syntax"));
        let mut link = open(&driver);
        assert_eq!(link.query("X").err().map(|e| e.code), Some(1064));
        assert!(link.query("X").is_ok());
        assert_eq!(driver.statements(), vec!["X", "X"]);
    }

    #[test]
    fn closed_link_reports_server_gone() {
        let driver = ScriptedDriver::new();
        let mut link = open(&driver);
        link.close();
        link.close();
        assert_eq!(driver.closes(), 1);
        assert_eq!(link.query("SELECT 1").err().map(|e| e.code), Some(SERVER_GONE));
    }

    #[test]
    fn escape_follows_mysql_rules() {
        let link = ScriptedLink::detached();
        assert_eq!(link.escape("a'b\\c\n"), "a\\'b\\\\c\\n");
    }
}
