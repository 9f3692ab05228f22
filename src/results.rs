//! Lazily materialized, seekable query results.
//!
//! A [`ResultSet`] wraps the outcome of one statement and builds its
//! [`ResultCursor`] on first access. Rows are pulled from the driver's
//! buffered [`crate::driver::RawResult`] one at a time and passed through a
//! [`RowHydrator`].

mod buffered;
mod column;
mod cursor;
mod fields;
mod hydrate;
mod result_set;
mod row;

pub use buffered::BufferedResult;
pub use column::Column;
pub use cursor::ResultCursor;
pub use fields::{Field, Fields};
pub use hydrate::{Converting, FnHydrator, RawRows, RowHydrator, Typed};
pub use result_set::ResultSet;
pub use row::{Columns, Row};
