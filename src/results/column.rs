use crate::error::{DbError, Result};
use crate::types::{ColumnRef, Value};

use super::cursor::ResultCursor;

/// Projects one column of every row, starting from the first row.
#[derive(Debug)]
pub struct Column<'a> {
    cursor: &'a mut ResultCursor,
    column: ColumnRef,
    started: bool,
}

impl<'a> Column<'a> {
    pub(crate) fn new(cursor: &'a mut ResultCursor, column: ColumnRef) -> Self {
        Self {
            cursor,
            column,
            started: false,
        }
    }
}

impl Iterator for Column<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if let Err(err) = self.cursor.rewind() {
                return Some(Err(err));
            }
        }
        let row = match self.cursor.next_row() {
            Ok(row) => row?,
            Err(err) => return Some(Err(err)),
        };
        Some(
            row.value(&self.column)
                .cloned()
                .ok_or_else(|| DbError::UnknownColumn(self.column.to_string())),
        )
    }
}
