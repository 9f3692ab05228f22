//! Identifier allocation on a dedicated connection.
//!
//! Counters live in one table row per sequence name. Each allocation runs
//! in its own short transaction on the pool's connection, so a rollback on
//! any other connection never returns an issued value.
//!
//! On a single-writer database (SQLite) the pool's link cannot write while
//! another link holds an open write transaction on the same file. A pool
//! created by [`Connection::sequence_pool`] waits at most
//! [`SINGLE_WRITER_LOCK_WAIT`] for the lock and then fails with
//! `DbError::Deadlock`, so allocate before the primary transaction writes.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::connection::Connection;
use crate::error::{DbError, Result};
use crate::types::Value;

pub const DEFAULT_TABLE: &str = "sequences";

/// Lock wait of a connection's pool on a single-writer database.
pub const SINGLE_WRITER_LOCK_WAIT: Duration = Duration::from_millis(250);

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Allocates increasing integers per sequence name.
#[derive(Debug)]
pub struct SequencePool {
    connection: Connection,
    table: String,
    table_ready: bool,
    single_writer: bool,
}

impl SequencePool {
    /// A pool over `connection`, which must not be shared with other work.
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            single_writer: connection.single_writer(),
            connection,
            table: DEFAULT_TABLE.to_string(),
            table_ready: false,
        }
    }

    /// # Errors
    /// `DbError::Config` if `table` is not a plain identifier.
    pub fn with_table(connection: Connection, table: &str) -> Result<Self> {
        if !TABLE_NAME.is_match(table) {
            return Err(DbError::Config(format!("invalid sequence table name {table:?}")));
        }
        Ok(Self {
            table: table.to_string(),
            ..Self::new(connection)
        })
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn ensure_table(&mut self) -> Result<()> {
        if !self.table_ready {
            self.connection.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (name VARCHAR(255) NOT NULL PRIMARY KEY, id INTEGER NOT NULL)",
                    self.table
                ),
                (),
            )?;
            self.table_ready = true;
        }
        Ok(())
    }

    /// Allocate the next value of `name`, starting at 1.
    ///
    /// # Errors
    /// Any statement error; `DbError::Deadlock` when a single-writer
    /// database is locked by another link's open write; `DbError::Conversion`
    /// if the stored counter is not a non-negative integer.
    pub fn next(&mut self, name: &str) -> Result<u64> {
        let id = self.allocate(name).map_err(|err| self.lock_conflict(err))?;
        let id = counter_value(name, id)?
            .ok_or_else(|| DbError::Conversion(format!("sequence {name} vanished during allocation")))?;
        tracing::debug!(sequence = name, id, "sequence value allocated");
        Ok(id)
    }

    fn allocate(&mut self, name: &str) -> Result<Option<Value>> {
        self.ensure_table()?;
        let table = &self.table;
        self.connection.transaction().run(|tx| {
            let updated = tx
                .execute(&format!("UPDATE {table} SET id = id + 1 WHERE name = ?"), [name])?
                .count();
            if updated == 0 {
                tx.execute(&format!("INSERT INTO {table} (name, id) VALUES (?, 1)"), [name])?;
            }
            tx.execute(&format!("SELECT id FROM {table} WHERE name = ?"), [name])?
                .scalar(0usize)
        })
    }

    fn lock_conflict(&self, err: DbError) -> DbError {
        match err {
            DbError::Deadlock { code, message } if self.single_writer => DbError::Deadlock {
                code,
                message: format!(
                    "sequence table {} is locked by another writer and this database admits one \
                     writing transaction at a time; allocate before writing on the primary \
                     connection ({message})",
                    self.table
                ),
            },
            other => other,
        }
    }

    /// The last value issued for `name`, without allocating.
    ///
    /// # Errors
    /// Any statement error.
    pub fn current(&mut self, name: &str) -> Result<Option<u64>> {
        self.ensure_table()?;
        let value = self
            .connection
            .execute(&format!("SELECT id FROM {} WHERE name = ?", self.table), [name])?
            .scalar(0usize)?;
        counter_value(name, value)
    }

    /// Drop the counter table and every sequence in it.
    ///
    /// # Errors
    /// Any statement error.
    pub fn clear(&mut self) -> Result<()> {
        self.connection
            .execute(&format!("DROP TABLE IF EXISTS {}", self.table), ())?;
        self.table_ready = false;
        Ok(())
    }

    pub fn close(&mut self) {
        self.connection.close();
    }
}

fn counter_value(name: &str, value: Option<Value>) -> Result<Option<u64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_int()
            .and_then(|id| u64::try_from(id).ok())
            .map(Some)
            .ok_or_else(|| DbError::Conversion(format!("sequence {name} holds {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DataSource;
    use crate::test_utils::{Response, ScriptedDriver};

    fn pool(driver: &ScriptedDriver) -> SequencePool {
        SequencePool::new(Connection::new(DataSource::default(), Arc::new(driver.clone())))
    }

    #[test]
    fn first_allocation_inserts_the_row() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver
            .on("UPDATE sequences SET id = id + 1 WHERE name = 'orders'", Response::done(0))
            .on(
                "SELECT id FROM sequences WHERE name = 'orders'",
                Response::rows(&["id"], vec![vec![Value::Int(1)]]),
            );
        let mut pool = pool(&driver);
        assert_eq!(pool.next("orders")?, 1);
        assert_eq!(
            driver.statements(),
            vec![
                "CREATE TABLE IF NOT EXISTS sequences (name VARCHAR(255) NOT NULL PRIMARY KEY, id INTEGER NOT NULL)",
                "BEGIN",
                "UPDATE sequences SET id = id + 1 WHERE name = 'orders'",
                "INSERT INTO sequences (name, id) VALUES ('orders', 1)",
                "SELECT id FROM sequences WHERE name = 'orders'",
                "COMMIT",
            ]
        );
        Ok(())
    }

    #[test]
    fn existing_row_is_only_incremented() -> Result<()> {
        let driver = ScriptedDriver::new();
        driver
            .on("UPDATE sequences SET id = id + 1 WHERE name = 'orders'", Response::done(1))
            .on(
                "SELECT id FROM sequences WHERE name = 'orders'",
                Response::rows(&["id"], vec![vec![Value::Int(8)]]),
            );
        let mut pool = pool(&driver);
        assert_eq!(pool.next("orders")?, 8);
        assert!(!driver.statements().iter().any(|s| s.starts_with("INSERT")));
        Ok(())
    }

    #[test]
    fn failed_allocation_rolls_back() {
        let driver = ScriptedDriver::new();
        driver.on(
            "UPDATE sequences SET id = id + 1 WHERE name = 'orders'",
            Response::error(1213, "Deadlock found"),
        );
        let mut pool = pool(&driver);
        assert!(matches!(pool.next("orders"), Err(DbError::Deadlock { .. })));
        assert_eq!(driver.statements().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn table_names_are_validated() {
        let conn = || Connection::new(DataSource::default(), Arc::new(ScriptedDriver::new()));
        assert!(SequencePool::with_table(conn(), "id_blocks").is_ok());
        assert!(matches!(
            SequencePool::with_table(conn(), "seq; DROP TABLE users"),
            Err(DbError::Config(_))
        ));
    }

    #[test]
    fn clear_recreates_table_on_next_use() -> Result<()> {
        let driver = ScriptedDriver::new();
        let mut pool = pool(&driver);
        assert_eq!(pool.current("x")?, None);
        pool.clear()?;
        pool.current("x")?;
        let creates = driver
            .statements()
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count();
        assert_eq!(creates, 2);
        Ok(())
    }

    #[test]
    fn single_writer_pool_fails_fast_with_guidance() {
        let driver = ScriptedDriver::new().with_lock_codes(&[5, 6]).with_single_writer();
        driver.on(
            "UPDATE sequences SET id = id + 1 WHERE name = 'orders'",
            Response::error(5, "database is locked"),
        );
        let mut conn = Connection::new(DataSource::default(), Arc::new(driver.clone()));
        let err = conn.sequence_pool().next("orders").expect_err("locked");

        match err {
            DbError::Deadlock { code, message } => {
                assert_eq!(code, 5);
                assert!(message.contains("allocate before writing"));
                assert!(message.ends_with("(database is locked)"));
            }
            other => panic!("expected a deadlock, got {other:?}"),
        }
        let options = driver.last_options().expect("pool link opened");
        assert_eq!(options.connect_timeout, SINGLE_WRITER_LOCK_WAIT);
        assert_eq!(conn.source().connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn multi_writer_lock_errors_pass_through() {
        let driver = ScriptedDriver::new();
        driver.on(
            "UPDATE sequences SET id = id + 1 WHERE name = 'orders'",
            Response::error(1213, "Deadlock found"),
        );
        let mut conn = Connection::new(DataSource::default(), Arc::new(driver.clone()));
        assert!(matches!(
            conn.sequence_pool().next("orders"),
            Err(DbError::Deadlock { message, .. }) if message == "Deadlock found"
        ));
        assert_eq!(
            driver.last_options().map(|o| o.connect_timeout),
            Some(Duration::from_secs(5))
        );
    }
}
