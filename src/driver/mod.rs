//! Physical database drivers.
//!
//! A [`Driver`] turns a data source name into a pool-managed [`Connection`]. Drivers are
//! looked up by name in a [`DriverRegistry`] that the caller owns and passes in, so there
//! is no process-wide registration step.

pub mod postgres;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::pool::PoolStats;
use crate::types::{ExecResult, Row, Rows, Value};
use crate::{ResolverError, Result};

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// Opens physical connections for one database backend.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>>;
}

/// One physical database, internally pooled and safe to share between tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    fn driver_name(&self) -> &str;

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows>;

    async fn query_row(&self, ctx: &Context, sql: &str, args: &[Value]) -> Row {
        Row::new(self.query(ctx, sql, args).await)
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult>;

    async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Transaction>>;

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>>;

    async fn ping(&self, ctx: &Context) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn set_max_open_conns(&self, n: usize);

    fn set_max_idle_conns(&self, n: usize);

    fn set_conn_max_lifetime(&self, lifetime: Duration);

    fn stats(&self) -> PoolStats;
}

/// A statement prepared against one physical database.
#[async_trait]
pub trait Statement: Send + Sync {
    async fn query(&self, ctx: &Context, args: &[Value]) -> Result<Rows>;

    async fn query_row(&self, ctx: &Context, args: &[Value]) -> Row {
        Row::new(self.query(ctx, args).await)
    }

    async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<ExecResult>;

    async fn close(&self) -> Result<()>;
}

/// A transaction pinned to a single pooled connection.
///
/// Dropping it without `commit` or `rollback` abandons the connection rather than
/// returning it to the pool mid-transaction.
#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows>;

    async fn query_row(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Row {
        Row::new(self.query(ctx, sql, args).await)
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled `sqlite` and `postgres` drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqliteDriver));
        registry.register(Arc::new(PostgresDriver));
        registry
    }

    /// Adds a driver, replacing any previous driver of the same name.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| ResolverError::UnknownDriver(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}
