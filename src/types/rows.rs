use crate::types::value::{FromValue, Value};
use crate::{ResolverError, Result};

/// A fully materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn get(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn into_values(self) -> Vec<Vec<Value>> {
        self.rows
    }
}

/// A borrowed view of one row inside [`Rows`].
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    pub fn get<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| ResolverError::ColumnNotFound(format!("index {index}")))?;
        T::from_value(value)
    }

    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ResolverError::ColumnNotFound(name.to_string()))?;
        self.get(index)
    }
}

/// Conversion of a whole row into a caller type.
pub trait FromRow: Sized {
    fn from_row(row: RowRef<'_>) -> Result<Self>;
}

impl FromRow for Vec<Value> {
    fn from_row(row: RowRef<'_>) -> Result<Self> {
        Ok(row.values().to_vec())
    }
}

macro_rules! tuple_from_row {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: FromValue),+> FromRow for ($($name,)+) {
            fn from_row(row: RowRef<'_>) -> Result<Self> {
                Ok(($(row.get::<$name>($idx)?,)+))
            }
        }
    };
}

tuple_from_row!(A: 0);
tuple_from_row!(A: 0, B: 1);
tuple_from_row!(A: 0, B: 1, C: 2);
tuple_from_row!(A: 0, B: 1, C: 2, D: 3);
tuple_from_row!(A: 0, B: 1, C: 2, D: 3, E: 4);

/// Result of a single-row query. Errors are deferred until [`Row::scan`].
#[derive(Debug)]
pub struct Row {
    result: Result<Rows>,
}

impl Row {
    pub fn new(result: Result<Rows>) -> Self {
        Self { result }
    }

    /// The execution error, if the query itself failed.
    ///
    /// An empty result is not an error here; it surfaces as `NoRows` from `scan`.
    pub fn err(&self) -> Option<&ResolverError> {
        self.result.as_ref().err()
    }

    pub fn scan<T: FromRow>(self) -> Result<T> {
        let rows = self.result?;
        let first = rows.get(0).ok_or(ResolverError::NoRows)?;
        T::from_row(first)
    }

    pub fn into_values(self) -> Result<Vec<Value>> {
        self.scan()
    }
}

impl From<Result<Rows>> for Row {
    fn from(result: Result<Rows>) -> Self {
        Row::new(result)
    }
}

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_id,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Not every driver reports it; postgres never does.
    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }
}
