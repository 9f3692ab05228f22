use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::types::{ColumnRef, Value};

/// Column names of a result, shared by every row it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Columns {
    names: Vec<String>,
    // Name to index, so lookups by name avoid repeated string comparisons
    index: HashMap<String, usize>,
}

impl Columns {
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            // first occurrence wins for duplicate names
            index.entry(name.clone()).or_insert(i);
        }
        Self { names, index }
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A row fetched from a result.
///
/// Values are addressable by zero-based offset or by column name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Columns>,
    values: Vec<Value>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Arc<Columns>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a standalone row from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (names, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(Arc::new(Columns::new(names)), values)
    }

    #[must_use]
    pub fn columns(&self) -> &Arc<Columns> {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Get a value by column name.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&Value> {
        self.columns
            .position(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    #[must_use]
    pub fn value(&self, column: &ColumnRef) -> Option<&Value> {
        match column {
            ColumnRef::Index(idx) => self.get_by_index(*idx),
            ColumnRef::Name(name) => self.get(name),
        }
    }

    pub(crate) fn value_mut(&mut self, column_name: &str) -> Option<&mut Value> {
        self.columns
            .position(column_name)
            .and_then(|idx| self.values.get_mut(idx))
    }

    /// Iterate `(column name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The row as a JSON object keyed by column name.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect();
        JsonValue::Object(map)
    }
}
