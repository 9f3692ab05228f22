#![cfg(feature = "sqlite")]

use std::sync::Arc;

use serde::Deserialize;
use sql_link::prelude::*;
use tempfile::tempdir;

fn seeded() -> Result<Connection, DbError> {
    let source = DataSource::builder("localhost").strict(true).build()?;
    let mut conn = Connection::new(source, Arc::new(SqliteDriver));
    conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", ())?;
    for (id, name) in [(1, "x"), (2, "y"), (3, "z"), (4, "a"), (5, "b")] {
        conn.execute("INSERT INTO t (id, name) VALUES (?, ?)", vec![Value::Int(id), Value::from(name)])?;
    }
    Ok(conn)
}

#[test]
fn select_with_positional_param_yields_rows_in_order() -> Result<(), DbError> {
    let mut conn = seeded()?;
    let mut rs = conn.execute("SELECT id, name FROM t WHERE id > ?", [3])?;

    let first = rs.row()?.expect("first row");
    assert_eq!(first.get("id"), Some(&Value::Int(4)));
    assert_eq!(first.get("name"), Some(&Value::from("a")));
    let second = rs.row()?.expect("second row");
    assert_eq!(second.get("id"), Some(&Value::Int(5)));
    assert_eq!(second.get("name"), Some(&Value::from("b")));
    assert!(rs.row()?.is_none());
    Ok(())
}

#[derive(Debug, Deserialize, PartialEq)]
struct Named {
    id: i64,
    name: String,
}

#[test]
fn typed_rows_and_field_metadata() -> Result<(), DbError> {
    let mut conn = seeded()?;
    let rs = conn.execute("SELECT id, name FROM t WHERE name IN (?) ORDER BY id", vec![
        Value::List(vec![Value::from("a"), Value::from("b")]),
    ])?;
    assert_eq!(rs.fields().get("name").map(|f| f.column_type.as_str()), Some("TEXT"));

    let mut typed = rs.hydrate(Typed::<Named>::new())?;
    assert_eq!(typed.to_vec()?, vec![
        Named { id: 4, name: "a".into() },
        Named { id: 5, name: "b".into() },
    ]);
    Ok(())
}

#[test]
fn dml_reports_affected_rows_and_insert_id() -> Result<(), DbError> {
    let mut conn = seeded()?;
    let rs = conn.execute("UPDATE t SET name = ? WHERE id <= ?", vec![Value::from("it's"), Value::Int(2)])?;
    assert_eq!(rs.count(), 2);
    assert!(!rs.has_rows());

    let rs = conn.execute("INSERT INTO t (name) VALUES (?)", ["c"])?;
    assert_eq!(rs.last_insert_id(), 6);
    assert_eq!(
        conn.execute("SELECT name FROM t WHERE id = 1", ())?.scalar(0usize)?,
        Some(Value::from("it's"))
    );
    Ok(())
}

#[test]
fn backslash_is_an_ordinary_character_in_sqlite_literals() -> Result<(), DbError> {
    let mut conn = seeded()?;
    let row = conn
        .execute("SELECT 'C:\\' AS path, ? AS n, ? AS raw", vec![Value::Int(1), Value::from("a\\'b")])?
        .row()?
        .expect("one row");
    assert_eq!(row.get("path"), Some(&Value::from("C:\\")));
    assert_eq!(row.get("n"), Some(&Value::Int(1)));
    assert_eq!(row.get("raw"), Some(&Value::from("a\\'b")));
    Ok(())
}

#[test]
fn statement_errors_are_database_errors() -> Result<(), DbError> {
    let mut conn = seeded()?;
    let err = conn
        .execute("INSERT INTO t (id, name) VALUES (?, ?)", vec![Value::Int(1), Value::from("dupe")])
        .expect_err("primary key violation");
    assert!(matches!(err, DbError::Database { code: 19, .. }));
    Ok(())
}

#[test]
fn file_database_is_shared_between_connections() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("shared.db");
    let source = DataSource::builder("localhost")
        .database(path.to_string_lossy())
        .build()?;

    let mut writer = Connection::new(source.clone(), Arc::new(SqliteDriver));
    writer.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", ())?;
    writer.execute("INSERT INTO kv VALUES (?, ?)", vec![Value::from("a"), Value::Int(1)])?;

    let mut reader = Connection::new(source, Arc::new(SqliteDriver));
    assert_eq!(
        reader.execute("SELECT v FROM kv WHERE k = ?", ["a"])?.scalar("v")?,
        Some(Value::Int(1))
    );
    reader.select_database("main")?;
    assert!(matches!(
        reader.select_database("reports"),
        Err(DbError::Database { .. })
    ));
    Ok(())
}
