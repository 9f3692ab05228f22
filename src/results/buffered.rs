use std::sync::Arc;

use crate::driver::RawResult;
use crate::types::Value;

use super::fields::Field;
use super::row::{Columns, Row};

/// An in-memory [`RawResult`]: rows fully buffered on the client.
///
/// Drivers that read a whole result before returning (as MySQL's
/// `STORE_RESULT` does) can hand one of these to the engine.
#[derive(Debug, Clone)]
pub struct BufferedResult {
    columns: Arc<Columns>,
    fields: Vec<Field>,
    rows: Vec<Vec<Value>>,
    pointer: usize,
}

impl BufferedResult {
    #[must_use]
    pub fn new(fields: Vec<Field>, rows: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(Columns::new(
            fields.iter().map(|field| field.name.clone()).collect(),
        ));
        Self {
            columns,
            fields,
            rows,
            pointer: 0,
        }
    }

    /// Columns with an empty type name; handy for drivers without type info.
    #[must_use]
    pub fn with_columns(names: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self::new(
            names.iter().map(|name| Field::new(*name, "")).collect(),
            rows,
        )
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl RawResult for BufferedResult {
    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn data_seek(&mut self, offset: usize) -> bool {
        if offset < self.rows.len() {
            self.pointer = offset;
            true
        } else {
            false
        }
    }

    fn fetch_row(&mut self) -> Option<Row> {
        let values = self.rows.get(self.pointer)?.clone();
        self.pointer += 1;
        Some(Row::new(Arc::clone(&self.columns), values))
    }

    fn fields(&self) -> Vec<Field> {
        self.fields.clone()
    }
}
