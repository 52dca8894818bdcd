pub mod config;
pub mod context;
pub mod driver;
pub mod pool;
pub mod resolver;
pub mod types;

pub use context::Context;
pub use driver::{Driver, DriverRegistry, IsolationLevel, TxOptions};
pub use resolver::{DefaultClassifier, ErrorClassifier, LogicalDb, Stmt, Tx};
pub use types::{ExecResult, FromRow, FromValue, Row, RowRef, Rows, Value};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("no primary data source name configured")]
    MissingPrimary,

    #[error("unknown driver \"{0}\" (forgotten registration?)")]
    UnknownDriver(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{message}")]
    Driver {
        code: Option<String>,
        message: String,
    },

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("sql: no rows in result set")]
    NoRows,

    #[error("sql: database is closed")]
    Closed,

    #[error("sql: transaction has already been committed or rolled back")]
    TxDone,

    #[error("sql: statement is closed")]
    StmtClosed,

    #[error("feature not supported: {0}")]
    NotSupported(String),

    #[error("type conversion error: {0}")]
    TypeConversion(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

impl ResolverError {
    /// Driver failure without a SQLSTATE.
    pub fn driver(message: impl Into<String>) -> Self {
        ResolverError::Driver {
            code: None,
            message: message.into(),
        }
    }

    /// Driver failure tagged with a SQLSTATE code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        ResolverError::Driver {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// The SQLSTATE reported by the driver, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ResolverError::Driver { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ResolverError::MissingPrimary | ResolverError::UnknownDriver(_) | ResolverError::Config(_)
        )
    }
}

impl From<tokio::task::JoinError> for ResolverError {
    fn from(err: tokio::task::JoinError) -> Self {
        ResolverError::Task(err.to_string())
    }
}
