//! SQLite driver over `rusqlite`.
//!
//! The data source's `database` names the file to open, or `:memory:` when
//! absent. Results are read in full before `query` returns, like a MySQL
//! stored result, so cursors can seek freely.
//!
//! SQLite admits one writing transaction per database file. While one link
//! holds an open write, every other link (including a connection's
//! [`SequencePool`](crate::sequence::SequencePool)) waits out
//! `busy_timeout` and then fails with `SQLITE_BUSY`.

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::types::Value as SqliteValue;

use crate::config::DataSource;
use crate::driver::{Driver, DriverError, Link, LinkOptions, QueryOutcome, SqlMode};
use crate::results::{BufferedResult, Field};
use crate::types::Value;

/// Path used when the data source names no database.
pub const MEMORY: &str = ":memory:";

/// `SQLITE_ERROR`, also used for failures that carry no SQLite code.
pub const SQLITE_ERROR: u32 = 1;
/// `SQLITE_BUSY`.
pub const SQLITE_BUSY: u32 = 5;
/// `SQLITE_LOCKED`.
pub const SQLITE_LOCKED: u32 = 6;
/// `SQLITE_MISUSE`.
pub const SQLITE_MISUSE: u32 = 21;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn open(
        &self,
        source: &DataSource,
        options: &LinkOptions,
    ) -> Result<Box<dyn Link>, DriverError> {
        if options.tls.is_some() {
            return Err(DriverError::new(
                SQLITE_MISUSE,
                "TLS is not available for SQLite databases",
            ));
        }
        let path = source.database.as_deref().unwrap_or(MEMORY);
        let conn = rusqlite::Connection::open(path).map_err(driver_error)?;
        conn.busy_timeout(options.connect_timeout)
            .map_err(driver_error)?;
        if options.sql_mode == SqlMode::Traditional {
            conn.execute_batch("PRAGMA foreign_keys = ON")
                .map_err(driver_error)?;
        }
        Ok(Box::new(SqliteLink {
            conn: Some(conn),
            thread_id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            affected: 0,
            insert_id: 0,
        }))
    }

    fn lock_contention_codes(&self) -> &'static [u32] {
        &[SQLITE_BUSY, SQLITE_LOCKED]
    }

    fn single_writer(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct SqliteLink {
    conn: Option<rusqlite::Connection>,
    thread_id: u64,
    affected: u64,
    insert_id: u64,
}

fn closed() -> DriverError {
    DriverError::new(SQLITE_MISUSE, "SQLite link is closed")
}

fn driver_error(err: rusqlite::Error) -> DriverError {
    let code = match &err {
        // primary result code; the extended code sits in the high bits
        rusqlite::Error::SqliteFailure(failure, _) => {
            u32::try_from(failure.extended_code & 0xff).unwrap_or(SQLITE_ERROR)
        }
        _ => SQLITE_ERROR,
    };
    DriverError::new(code, err.to_string())
}

fn from_sqlite(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(i) => Value::Int(i),
        SqliteValue::Real(f) => Value::Float(f),
        SqliteValue::Text(s) => Value::Text(s),
        SqliteValue::Blob(b) => Value::Blob(b),
    }
}

impl Link for SqliteLink {
    fn set_charset(&mut self, charset: &str) -> Result<(), DriverError> {
        if self.conn.is_none() {
            return Err(closed());
        }
        match charset.to_ascii_lowercase().as_str() {
            "utf8" | "utf8mb4" | "utf8mb3" | "utf-8" => Ok(()),
            other => Err(DriverError::new(
                SQLITE_ERROR,
                format!("SQLite databases are UTF-8; charset {other} is not supported"),
            )),
        }
    }

    fn select_db(&mut self, database: &str) -> Result<(), DriverError> {
        let conn = self.conn.as_ref().ok_or_else(closed)?;
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_database_list")
            .map_err(driver_error)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(driver_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(driver_error)?;
        if names.iter().any(|name| name == database) {
            Ok(())
        } else {
            Err(DriverError::new(
                SQLITE_ERROR,
                format!("unknown database {database}"),
            ))
        }
    }

    fn query(&mut self, sql: &str) -> Result<QueryOutcome, DriverError> {
        let conn = self.conn.as_ref().ok_or_else(closed)?;
        let mut stmt = conn.prepare(sql).map_err(driver_error)?;

        if stmt.column_count() == 0 {
            let changed = stmt.execute([]).map_err(driver_error)?;
            self.affected = u64::try_from(changed).unwrap_or(u64::MAX);
            self.insert_id = u64::try_from(conn.last_insert_rowid()).unwrap_or_default();
            return Ok(QueryOutcome::Done);
        }

        let fields: Vec<Field> = stmt
            .columns()
            .iter()
            .map(|column| Field::new(column.name(), column.decl_type().unwrap_or_default()))
            .collect();
        let width = fields.len();

        let mut rows = stmt.query([]).map_err(driver_error)?;
        let mut buffered = Vec::new();
        while let Some(row) = rows.next().map_err(driver_error)? {
            let values = (0..width)
                .map(|idx| row.get::<_, SqliteValue>(idx).map(from_sqlite))
                .collect::<Result<Vec<_>, _>>()
                .map_err(driver_error)?;
            buffered.push(values);
        }

        self.affected = buffered.len() as u64;
        Ok(QueryOutcome::Rows(Box::new(BufferedResult::new(
            fields, buffered,
        ))))
    }

    fn escape(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    fn backslash_escapes(&self) -> bool {
        false
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
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                tracing::warn!(thread_id = self.thread_id, error = %err, "closing SQLite link failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RawResult;

    fn open(strict: bool) -> Box<dyn Link> {
        let source = DataSource::builder("localhost")
            .strict(strict)
            .build()
            .expect("valid source");
        SqliteDriver
            .open(&source, &LinkOptions::for_source(&source))
            .expect("in-memory database opens")
    }

    fn rows(outcome: QueryOutcome) -> Box<dyn RawResult> {
        match outcome {
            QueryOutcome::Rows(raw) => raw,
            QueryOutcome::Done => panic!("expected rows"),
        }
    }

    #[test]
    fn queries_buffer_rows_with_declared_types() -> Result<(), DriverError> {
        let mut link = open(false);
        link.query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)")?;
        link.query("INSERT INTO t (name, score, data) VALUES ('a', 1.5, X'00FF')")?;
        assert_eq!(link.insert_id(), 1);
        assert_eq!(link.affected_rows(), 1);

        let mut raw = rows(link.query("SELECT id, name, score, data, NULL AS missing FROM t")?);
        assert_eq!(raw.num_rows(), 1);
        let types: Vec<String> = raw.fields().into_iter().map(|f| f.column_type).collect();
        assert_eq!(types, vec!["INTEGER", "TEXT", "REAL", "BLOB", ""]);
        let row = raw.fetch_row().expect("one row");
        assert_eq!(
            row.values(),
            &[
                Value::Int(1),
                Value::from("a"),
                Value::Float(1.5),
                Value::Blob(vec![0, 255]),
                Value::Null
            ]
        );
        Ok(())
    }

    #[test]
    fn errors_carry_primary_result_code() {
        let mut link = open(false);
        link.query("CREATE TABLE t (id INTEGER PRIMARY KEY)").expect("create");
        link.query("INSERT INTO t VALUES (1)").expect("insert");
        let err = link.query("INSERT INTO t VALUES (1)").expect_err("duplicate key");
        assert_eq!(err.code, 19);
        let err = link.query("SELEC 1").expect_err("syntax");
        assert_eq!(err.code, SQLITE_ERROR);
    }

    #[test]
    fn strict_mode_enforces_foreign_keys() -> Result<(), DriverError> {
        let mut link = open(true);
        let mut raw = rows(link.query("PRAGMA foreign_keys")?);
        assert_eq!(raw.fetch_row().and_then(|r| r.get_by_index(0).cloned()), Some(Value::Int(1)));
        Ok(())
    }

    #[test]
    fn charset_and_schema_checks() {
        let mut link = open(false);
        assert!(link.set_charset("utf8mb4").is_ok());
        assert!(link.set_charset("latin1").is_err());
        assert!(link.select_db("main").is_ok());
        assert!(link.select_db("reports").is_err());
    }

    #[test]
    fn tls_material_is_rejected() {
        let mut source = DataSource::default();
        source.tls.ca = Some("/etc/ca.pem".into());
        let err = SqliteDriver
            .open(&source, &LinkOptions::for_source(&source))
            .err()
            .expect("tls refused");
        assert_eq!(err.code, SQLITE_MISUSE);
    }

    #[test]
    fn closed_link_refuses_queries() {
        let mut link = open(false);
        link.close();
        link.close();
        assert_eq!(link.query("SELECT 1").err().map(|e| e.code), Some(SQLITE_MISUSE));
        assert_eq!(link.escape("o'neil"), "o''neil");
        assert!(!link.backslash_escapes());
    }
}
