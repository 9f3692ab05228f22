use std::fmt;

use crate::driver::RawResult;
use crate::error::{DbError, Result};

use super::hydrate::{RawRows, RowHydrator};

/// Lazy, seekable iterator over a buffered result.
///
/// `position` is the offset of the row the next read returns and always lies
/// in `[0, row_count]`. A row fetched by [`ResultCursor::seek`] is cached
/// until the next read consumes it. The row count is fixed when the cursor is
/// built. Dropping the cursor drops, and so releases, the raw result.
pub struct ResultCursor<H: RowHydrator = RawRows> {
    raw: Box<dyn RawResult>,
    hydrator: H,
    count: usize,
    position: usize,
    current: Option<H::Output>,
}

impl<H: RowHydrator> ResultCursor<H> {
    pub fn new(raw: Box<dyn RawResult>, hydrator: H) -> Self {
        let count = raw.num_rows();
        Self {
            raw,
            hydrator,
            count,
            position: 0,
            current: None,
        }
    }

    /// Number of rows reported by the server.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.count
    }

    /// Offset of the row the next read returns.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.position
    }

    /// True while a row remains at or after the current position.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.position < self.count
    }

    pub(crate) fn raw(&self) -> &(dyn RawResult + 'static) {
        self.raw.as_ref()
    }

    /// Reposition so the next read returns row `position`.
    ///
    /// Seeking to the current position is a no-op. Otherwise the row at
    /// `position` is fetched (and hydrated) straight away.
    ///
    /// # Errors
    /// `DbError::Range` for negative offsets or offsets past the last row;
    /// any hydration error for the fetched row.
    pub fn seek(&mut self, position: i64) -> Result<()> {
        let count = self.count;
        let out_of_range = || DbError::Range { position, count };
        let target = usize::try_from(position).map_err(|_| out_of_range())?;

        // an empty result only has offset 0
        if target >= count && !(count == 0 && target == 0) {
            return Err(out_of_range());
        }
        if target == self.position {
            return Ok(());
        }

        self.current = None;
        if !self.raw.data_seek(target) {
            return Err(out_of_range());
        }
        self.position = target;
        self.load_current()
    }

    /// Seek back to the first row.
    ///
    /// # Errors
    /// Returns any hydration error for the first row.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek(0)
    }

    /// The row at the current position, fetched if not cached yet. Does not
    /// advance.
    ///
    /// # Errors
    /// Returns any hydration error for the row.
    pub fn current(&mut self) -> Result<Option<&H::Output>> {
        if self.current.is_none() && self.valid() {
            self.load_current()?;
        }
        Ok(self.current.as_ref())
    }

    /// Read the row at the current position and advance past it.
    ///
    /// # Errors
    /// Returns any hydration error for the row; the cursor still advances.
    pub fn next_row(&mut self) -> Result<Option<H::Output>> {
        if !self.valid() {
            return Ok(None);
        }
        let row = match self.current.take() {
            Some(row) => Ok(Some(row)),
            None => self.fetch(),
        };
        self.position += 1;
        row
    }

    /// Rewind and collect every row.
    ///
    /// # Errors
    /// Returns the first hydration error.
    pub fn to_vec(&mut self) -> Result<Vec<H::Output>> {
        self.rewind()?;
        let mut rows = Vec::with_capacity(self.count);
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn load_current(&mut self) -> Result<()> {
        match self.fetch() {
            Ok(row) => {
                self.current = row;
                Ok(())
            }
            Err(err) => {
                // keep the buffer pointer on the row `position` names
                self.raw.data_seek(self.position);
                Err(err)
            }
        }
    }

    fn fetch(&mut self) -> Result<Option<H::Output>> {
        self.raw
            .fetch_row()
            .map(|row| self.hydrator.hydrate(row))
            .transpose()
    }
}

impl<H: RowHydrator> Iterator for ResultCursor<H> {
    type Item = Result<H::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.position;
        (remaining, Some(remaining))
    }
}

impl<H: RowHydrator> fmt::Debug for ResultCursor<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("count", &self.count)
            .field("position", &self.position)
            .field("cached", &self.current.is_some())
            .finish_non_exhaustive()
    }
}
