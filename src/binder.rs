//! Client-side parameter binding.
//!
//! Placeholders are replaced by escaped SQL literals before the statement is
//! sent. `?` takes the next positional value, `:name` takes a named value.
//! Placeholders inside quoted strings, quoted identifiers and comments are
//! left alone.

use std::fmt::Write;

use crate::driver::Link;
use crate::error::{DbError, Result};
use crate::types::{Params, Value};

/// Binds parameters using the escaping rules of a live link.
pub struct Binder<'a> {
    link: &'a dyn Link,
}

#[derive(Clone, Copy)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment,
}

impl<'a> Binder<'a> {
    #[must_use]
    pub fn new(link: &'a dyn Link) -> Self {
        Self { link }
    }

    /// Interpolate `params` into `sql`.
    ///
    /// # Errors
    /// `DbError::Parameter` when the placeholder count and the positional
    /// parameter count differ, when a named parameter is missing, or when a
    /// value cannot be rendered.
    pub fn bind(&self, sql: &str, params: &Params) -> Result<String> {
        let (positional, named) = match params {
            Params::Positional(values) => (values.as_slice(), None),
            Params::Named(map) => (&[][..], Some(map)),
            Params::None => (&[][..], None),
        };
        let binds_positional = matches!(params, Params::Positional(_));
        let backslash_escapes = self.link.backslash_escapes();

        let bytes = sql.as_bytes();
        let mut out = String::with_capacity(sql.len() + 16);
        let mut next_positional = positional.iter();
        let mut used = 0usize;
        let mut copied = 0usize;
        let mut state = State::Normal;
        let mut idx = 0usize;

        while idx < bytes.len() {
            let b = bytes[idx];
            let peek = bytes.get(idx + 1).copied();
            match state {
                State::Normal => match b {
                    b'\'' => state = State::SingleQuoted,
                    b'"' => state = State::DoubleQuoted,
                    b'`' => state = State::Backtick,
                    b'#' => state = State::LineComment,
                    b'-' if peek == Some(b'-') => {
                        state = State::LineComment;
                        idx += 1;
                    }
                    b'/' if peek == Some(b'*') => {
                        state = State::BlockComment;
                        idx += 1;
                    }
                    b'?' if binds_positional => {
                        let value = next_positional.next().ok_or_else(|| {
                            DbError::Parameter(format!(
                                "statement has more placeholders than the {} parameters given",
                                positional.len()
                            ))
                        })?;
                        out.push_str(&sql[copied..idx]);
                        out.push_str(&self.quote(value)?);
                        used += 1;
                        copied = idx + 1;
                    }
                    b':' if peek == Some(b':') => idx += 1,
                    b':' => {
                        if let (Some(map), Some(end)) = (named, scan_identifier(bytes, idx + 1)) {
                            let name = &sql[idx + 1..end];
                            let value = map.get(name).ok_or_else(|| {
                                DbError::Parameter(format!("missing named parameter :{name}"))
                            })?;
                            out.push_str(&sql[copied..idx]);
                            out.push_str(&self.quote(value)?);
                            copied = end;
                            idx = end - 1;
                        }
                    }
                    _ => {}
                },
                State::SingleQuoted | State::DoubleQuoted => {
                    let quote = if matches!(state, State::SingleQuoted) {
                        b'\''
                    } else {
                        b'"'
                    };
                    if backslash_escapes && b == b'\\' {
                        idx += 1; // skip escaped character
                    } else if b == quote {
                        if peek == Some(quote) {
                            idx += 1; // skip doubled quote
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::Backtick => {
                    if b == b'`' {
                        if peek == Some(b'`') {
                            idx += 1;
                        } else {
                            state = State::Normal;
                        }
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        state = State::Normal;
                    }
                }
                State::BlockComment => {
                    if b == b'*' && peek == Some(b'/') {
                        state = State::Normal;
                        idx += 1;
                    }
                }
            }
            idx += 1;
        }

        if used < positional.len() {
            return Err(DbError::Parameter(format!(
                "{} parameters given but the statement has {used} placeholders",
                positional.len()
            )));
        }

        out.push_str(&sql[copied.min(sql.len())..]);
        Ok(out)
    }

    /// Render one value as a SQL literal.
    ///
    /// # Errors
    /// `DbError::Parameter` for non-finite floats.
    pub fn quote(&self, value: &Value) -> Result<String> {
        Ok(match value {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(f) => {
                return Err(DbError::Parameter(format!("cannot bind non-finite float {f}")));
            }
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Text(s) => self.quote_str(s),
            Value::Timestamp(ts) => self.quote_str(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Date(d) => self.quote_str(&d.format("%Y-%m-%d").to_string()),
            Value::Json(json) => self.quote_str(&json.to_string()),
            Value::Blob(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2 + 3);
                hex.push_str("X'");
                for byte in bytes {
                    let _ = write!(hex, "{byte:02X}");
                }
                hex.push('\'');
                hex
            }
            Value::List(items) if items.is_empty() => "NULL".to_string(),
            Value::List(items) => items
                .iter()
                .map(|item| self.quote(item))
                .collect::<Result<Vec<_>>>()?
                .join(", "),
        })
    }

    fn quote_str(&self, value: &str) -> String {
        format!("'{}'", self.link.escape(value))
    }
}

fn scan_identifier(bytes: &[u8], start: usize) -> Option<usize> {
    let first = *bytes.get(start)?;
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return None;
    }
    let mut idx = start + 1;
    while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
        idx += 1;
    }
    Some(idx)
}
