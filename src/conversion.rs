//! Per-column type converters.
//!
//! Converters sit at the boundary between driver values and application
//! values. The hydration path calls [`TypeConverter::unmarshal`] on values
//! read from a row; callers preparing parameters call
//! [`TypeConverter::marshal`].

use chrono::NaiveDate;

use crate::error::{DbError, Result};
use crate::types::Value;

pub trait TypeConverter: Send + Sync {
    /// Raw driver value to application value.
    ///
    /// # Errors
    /// Returns `DbError::Conversion` if the raw value has the wrong shape.
    fn unmarshal(&self, raw: Value) -> Result<Value>;

    /// Application value to a value the driver can bind.
    ///
    /// # Errors
    /// Returns `DbError::Conversion` if the value has the wrong shape.
    fn marshal(&self, value: Value) -> Result<Value>;
}

/// `DATE` columns: text `YYYY-MM-DD` on the wire, [`Value::Date`] in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateConverter;

const DATE_FORMAT: &str = "%Y-%m-%d";

impl TypeConverter for DateConverter {
    fn unmarshal(&self, raw: Value) -> Result<Value> {
        match raw {
            Value::Null => Ok(Value::Null),
            Value::Date(date) => Ok(Value::Date(date)),
            Value::Timestamp(ts) => Ok(Value::Date(ts.date())),
            Value::Text(text) => {
                // DATETIME text is accepted by keeping the date part
                let date_part = text.get(..10).unwrap_or(&text);
                NaiveDate::parse_from_str(date_part, DATE_FORMAT)
                    .map(Value::Date)
                    .map_err(|e| DbError::Conversion(format!("invalid date {text:?}: {e}")))
            }
            other => Err(DbError::Conversion(format!(
                "cannot read a date from {other:?}"
            ))),
        }
    }

    fn marshal(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Date(date) => Ok(Value::Text(date.format(DATE_FORMAT).to_string())),
            Value::Timestamp(ts) => Ok(Value::Text(ts.date().format(DATE_FORMAT).to_string())),
            other => Err(DbError::Conversion(format!(
                "cannot write {other:?} as a date"
            ))),
        }
    }
}

/// JSON documents stored in text columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl TypeConverter for JsonConverter {
    fn unmarshal(&self, raw: Value) -> Result<Value> {
        match raw {
            Value::Null => Ok(Value::Null),
            Value::Json(json) => Ok(Value::Json(json)),
            Value::Text(text) => Ok(Value::Json(serde_json::from_str(&text)?)),
            other => Err(DbError::Conversion(format!(
                "cannot read JSON from {other:?}"
            ))),
        }
    }

    fn marshal(&self, value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Json(json) => Ok(Value::Text(json.to_string())),
            other => Ok(Value::Text(other.to_json().to_string())),
        }
    }
}
