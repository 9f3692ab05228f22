use std::cell::OnceCell;
use std::fmt;

use crate::driver::RawResult;
use crate::error::{DbError, Result};
use crate::types::{ColumnRef, Value};

use super::buffered::BufferedResult;
use super::column::Column;
use super::cursor::ResultCursor;
use super::fields::Fields;
use super::hydrate::{RawRows, RowHydrator};
use super::row::Row;

/// The outcome of one executed statement.
///
/// The affected-row count and last insert id are captured when the statement
/// completes, so later statements on the same link cannot change them. Rows
/// are read through a [`ResultCursor`] built on first access and reused for
/// every later read.
pub struct ResultSet<H: RowHydrator = RawRows> {
    raw: Option<Box<dyn RawResult>>,
    // moved into the cursor when it is built
    hydrator: Option<H>,
    cursor: Option<ResultCursor<H>>,
    affected: u64,
    last_insert_id: u64,
    row_bearing: bool,
    fields: OnceCell<Fields>,
}

impl ResultSet<RawRows> {
    /// `raw` is absent for statements that return no rows.
    #[must_use]
    pub fn new(raw: Option<Box<dyn RawResult>>, affected: u64, last_insert_id: u64) -> Self {
        Self {
            row_bearing: raw.is_some(),
            raw,
            hydrator: Some(RawRows),
            cursor: None,
            affected,
            last_insert_id,
            fields: OnceCell::new(),
        }
    }

    /// A single value from the next row, by offset or column name.
    ///
    /// # Errors
    /// `DbError::UnknownColumn` if the row has no such column.
    pub fn scalar(&mut self, column: impl Into<ColumnRef>) -> Result<Option<Value>> {
        let column = column.into();
        let Some(row) = self.row()? else {
            return Ok(None);
        };
        row.value(&column)
            .cloned()
            .map(Some)
            .ok_or_else(|| DbError::UnknownColumn(column.to_string()))
    }

    /// A lazy sequence of one column's values across every row.
    ///
    /// # Errors
    /// Returns an error if the cursor cannot be built.
    pub fn column(&mut self, column: impl Into<ColumnRef>) -> Result<Column<'_>> {
        let column = column.into();
        Ok(Column::new(self.cursor()?, column))
    }
}

impl<H: RowHydrator> ResultSet<H> {
    /// Replace the hydrator. Only legal before the first read.
    ///
    /// # Errors
    /// `DbError::State` once the cursor has been built.
    pub fn hydrate<H2: RowHydrator>(self, hydrator: H2) -> Result<ResultSet<H2>> {
        if self.cursor.is_some() {
            return Err(DbError::state(
                "hydrator must be set before the result is iterated",
            ));
        }
        Ok(ResultSet {
            raw: self.raw,
            hydrator: Some(hydrator),
            cursor: None,
            affected: self.affected,
            last_insert_id: self.last_insert_id,
            row_bearing: self.row_bearing,
            fields: self.fields,
        })
    }

    /// The cursor over this result, built on first call.
    ///
    /// # Errors
    /// `DbError::State` if the hydrator went missing, which cannot happen
    /// through the public API.
    pub fn cursor(&mut self) -> Result<&mut ResultCursor<H>> {
        if self.cursor.is_none() {
            let hydrator = self
                .hydrator
                .take()
                .ok_or_else(|| DbError::state("result set has no hydrator"))?;
            let raw = self
                .raw
                .take()
                .unwrap_or_else(|| Box::new(BufferedResult::empty()));
            self.fields
                .get_or_init(|| Fields::new(raw.fields()));
            self.cursor = Some(ResultCursor::new(raw, hydrator));
        }
        self.cursor
            .as_mut()
            .ok_or_else(|| DbError::state("result cursor unavailable"))
    }

    /// The next row, or `None` once every row has been read.
    ///
    /// # Errors
    /// Returns any hydration error.
    pub fn row(&mut self) -> Result<Option<H::Output>> {
        self.cursor()?.next_row()
    }

    /// Reposition the shared cursor before further reads.
    ///
    /// # Errors
    /// `DbError::Range` for offsets outside the result.
    pub fn seek(&mut self, offset: i64) -> Result<&mut Self> {
        self.cursor()?.seek(offset)?;
        Ok(self)
    }

    /// Every row, from the first.
    ///
    /// # Errors
    /// Returns the first hydration error.
    pub fn to_vec(&mut self) -> Result<Vec<H::Output>> {
        self.cursor()?.to_vec()
    }

    /// Read the row at `offset` without consuming it. Moves the shared cursor.
    ///
    /// # Errors
    /// `DbError::Range` for offsets outside the result.
    pub fn get(&mut self, offset: i64) -> Result<Option<H::Output>>
    where
        H::Output: Clone,
    {
        let cursor = self.cursor()?;
        cursor.seek(offset)?;
        Ok(cursor.current()?.cloned())
    }

    /// Whether `offset` addresses a row.
    ///
    /// # Errors
    /// Returns an error if the cursor cannot be built.
    pub fn exists(&mut self, offset: i64) -> Result<bool> {
        let count = self.cursor()?.row_count();
        Ok(usize::try_from(offset).is_ok_and(|offset| offset < count))
    }

    /// Results are read-only.
    ///
    /// # Errors
    /// Always `DbError::Immutable`.
    pub fn set(&mut self, offset: i64, _row: H::Output) -> Result<()> {
        Err(DbError::Immutable(format!(
            "cannot replace row {offset}: result sets are read-only"
        )))
    }

    /// Results are read-only.
    ///
    /// # Errors
    /// Always `DbError::Immutable`.
    pub fn remove(&mut self, offset: i64) -> Result<()> {
        Err(DbError::Immutable(format!(
            "cannot remove row {offset}: result sets are read-only"
        )))
    }

    /// Affected-row count captured when the statement completed.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.affected
    }

    #[must_use]
    pub fn affected_rows(&self) -> u64 {
        self.affected
    }

    /// The auto-increment value generated by the statement.
    #[must_use]
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Whether the statement produced a row-bearing result.
    #[must_use]
    pub fn has_rows(&self) -> bool {
        self.row_bearing
    }

    /// Column metadata, built once.
    pub fn fields(&self) -> &Fields {
        self.fields.get_or_init(|| {
            self.raw
                .as_deref()
                .or_else(|| self.cursor.as_ref().map(ResultCursor::raw))
                .map(|raw| Fields::new(raw.fields()))
                .unwrap_or_default()
        })
    }
}

impl<H: RowHydrator> fmt::Debug for ResultSet<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSet")
            .field("affected", &self.affected)
            .field("last_insert_id", &self.last_insert_id)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl From<Row> for ResultSet<RawRows> {
    /// A one-row result, used by filters that substitute their own answer.
    fn from(row: Row) -> Self {
        let fields = row
            .columns()
            .names()
            .iter()
            .map(|name| super::fields::Field::new(name.clone(), ""))
            .collect();
        let raw = BufferedResult::new(fields, vec![row.into_values()]);
        ResultSet::new(Some(Box::new(raw)), 1, 0)
    }
}
