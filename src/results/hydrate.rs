use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::conversion::TypeConverter;
use crate::error::Result;

use super::row::Row;

/// Turns each fetched row into the value a cursor yields.
///
/// A cursor holds exactly one hydrator, fixed when the cursor is built.
pub trait RowHydrator {
    type Output;

    /// # Errors
    /// Implementations return an error when a row cannot be converted.
    fn hydrate(&self, row: Row) -> Result<Self::Output>;
}

/// Yields rows unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRows;

impl RowHydrator for RawRows {
    type Output = Row;

    fn hydrate(&self, row: Row) -> Result<Row> {
        Ok(row)
    }
}

/// Adapts a plain function into a hydrator.
#[derive(Clone, Copy)]
pub struct FnHydrator<F>(pub F);

impl<F, T> RowHydrator for FnHydrator<F>
where
    F: Fn(Row) -> Result<T>,
{
    type Output = T;

    fn hydrate(&self, row: Row) -> Result<T> {
        (self.0)(row)
    }
}

impl<F> fmt::Debug for FnHydrator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHydrator")
    }
}

/// Deserializes each row (as a JSON object keyed by column) into `T`.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Typed<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Typed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Typed<{}>", std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned> RowHydrator for Typed<T> {
    type Output = T;

    fn hydrate(&self, row: Row) -> Result<T> {
        Ok(serde_json::from_value(row.to_json())?)
    }
}

/// Runs column values through their [`TypeConverter`]s.
#[derive(Clone, Default)]
pub struct Converting {
    converters: Vec<(String, Arc<dyn TypeConverter>)>,
}

impl Converting {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn column(mut self, name: impl Into<String>, converter: Arc<dyn TypeConverter>) -> Self {
        self.converters.push((name.into(), converter));
        self
    }
}

impl fmt::Debug for Converting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.converters.iter().map(|(name, _)| name))
            .finish()
    }
}

impl RowHydrator for Converting {
    type Output = Row;

    fn hydrate(&self, mut row: Row) -> Result<Row> {
        for (name, converter) in &self.converters {
            if let Some(slot) = row.value_mut(name) {
                let raw = std::mem::replace(slot, crate::types::Value::Null);
                *slot = converter.unmarshal(raw)?;
            }
        }
        Ok(row)
    }
}
