// Driver-neutral values and result sets
pub mod value;
pub mod rows;

pub use value::{FromValue, Value};
pub use rows::{ExecResult, FromRow, Row, RowRef, Rows};
