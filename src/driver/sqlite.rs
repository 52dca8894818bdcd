//! Embedded SQLite driver built on rusqlite.
//!
//! The data source name is a file path or a `file:` URI, so a read-only replica can be
//! opened with `file:/path/app.db?mode=ro`. Each pooled connection is a separate SQLite
//! handle, which means `:memory:` gives every connection its own private database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{ErrorCode, InterruptHandle, OpenFlags, ToSql};
use tracing::debug;

use crate::context::Context;
use crate::driver::{Connection, Driver, IsolationLevel, Statement, Transaction, TxOptions};
use crate::pool::{Manager, Pool, PoolStats, PooledConnection};
use crate::types::{ExecResult, Rows, Value};
use crate::{ResolverError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SqlitePooled = PooledConnection<SqliteManager>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDriver;

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(SqliteConnection::open(dsn).await?))
    }
}

pub struct SqliteManager {
    path: String,
}

#[async_trait]
impl Manager for SqliteManager {
    type Connection = rusqlite::Connection;

    async fn connect(&self) -> Result<rusqlite::Connection> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || open_connection(&path)).await?
    }

    fn has_broken(&self, conn: &mut rusqlite::Connection) -> bool {
        // Still inside a transaction nobody will finish.
        !conn.is_autocommit()
    }
}

fn open_connection(path: &str) -> Result<rusqlite::Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;

    debug!("Opening sqlite connection with path: {}", path);
    let conn = rusqlite::Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// A pooled SQLite database.
pub struct SqliteConnection {
    pool: Pool<SqliteManager>,
}

impl SqliteConnection {
    /// Opens the first connection eagerly so an unusable path fails here.
    pub async fn open(dsn: &str) -> Result<Self> {
        if dsn.trim().is_empty() {
            return Err(ResolverError::Config("sqlite data source name is empty".to_string()));
        }
        let pool = Pool::new(SqliteManager {
            path: dsn.to_string(),
        });
        let first = pool.manager().connect().await?;
        pool.seed(first);
        Ok(Self { pool })
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        let sql = sql.to_string();
        let args = args.to_vec();
        with_conn(&self.pool, ctx, move |conn| query_rows(conn, &sql, &args)).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let sql = sql.to_string();
        let args = args.to_vec();
        with_conn(&self.pool, ctx, move |conn| exec_statement(conn, &sql, &args)).await
    }

    async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
        match opts.isolation {
            IsolationLevel::Default | IsolationLevel::Serializable => {}
            other => {
                return Err(ResolverError::NotSupported(format!(
                    "sqlite isolation level {other:?}"
                )));
            }
        }

        let read_only = opts.read_only;
        let conn = ctx.run(self.pool.acquire()).await?;
        let (conn, result) = ctx
            .run(run_blocking(conn, move |conn| {
                conn.execute_batch("BEGIN")?;
                if read_only {
                    conn.execute_batch("PRAGMA query_only = ON")?;
                }
                Ok(())
            }))
            .await?;
        result?;

        Ok(Box::new(SqliteTransaction {
            conn: Some(conn),
            read_only,
        }))
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        let owned = sql.to_string();
        with_conn(&self.pool, ctx, move |conn| {
            conn.prepare_cached(&owned)?;
            Ok(())
        })
        .await?;

        Ok(Box::new(SqliteStatement {
            pool: self.pool.clone(),
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        with_conn(&self.pool, ctx, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    fn set_max_open_conns(&self, n: usize) {
        self.pool.set_max_open(n);
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.pool.set_max_idle(n);
    }

    fn set_conn_max_lifetime(&self, lifetime: Duration) {
        self.pool.set_max_lifetime(lifetime);
    }

    fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

struct SqliteStatement {
    pool: Pool<SqliteManager>,
    sql: String,
    closed: AtomicBool,
}

impl SqliteStatement {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ResolverError::StmtClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Statement for SqliteStatement {
    async fn query(&self, ctx: &Context, args: &[Value]) -> Result<Rows> {
        self.check_open()?;
        let sql = self.sql.clone();
        let args = args.to_vec();
        with_conn(&self.pool, ctx, move |conn| query_rows(conn, &sql, &args)).await
    }

    async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        self.check_open()?;
        let sql = self.sql.clone();
        let args = args.to_vec();
        with_conn(&self.pool, ctx, move |conn| exec_statement(conn, &sql, &args)).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct SqliteTransaction {
    conn: Option<SqlitePooled>,
    read_only: bool,
}

impl SqliteTransaction {
    async fn step<T, F>(&mut self, ctx: &Context, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.take().ok_or(ResolverError::TxDone)?;
        let (conn, result) = ctx.run(run_blocking(conn, f)).await?;
        self.conn = Some(conn);
        result
    }

    async fn finish(&mut self, sql: &'static str) -> Result<()> {
        let read_only = self.read_only;
        let conn = self.conn.take().ok_or(ResolverError::TxDone)?;
        let (_conn, result) = run_blocking(conn, move |conn| {
            conn.execute_batch(sql)?;
            if read_only {
                conn.execute_batch("PRAGMA query_only = OFF")?;
            }
            Ok(())
        })
        .await?;
        result
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        let sql = sql.to_string();
        let args = args.to_vec();
        self.step(ctx, move |conn| query_rows(conn, &sql, &args)).await
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        let sql = sql.to_string();
        let args = args.to_vec();
        self.step(ctx, move |conn| exec_statement(conn, &sql, &args)).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.discard();
        }
    }
}

/// Interrupts the running statement if the waiting future is dropped.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("Interrupting sqlite statement after cancellation");
            handle.interrupt();
        }
    }
}

/// Runs `f` on the blocking pool and hands the connection back with its result.
async fn run_blocking<T, F>(mut conn: SqlitePooled, f: F) -> Result<(SqlitePooled, Result<T>)>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
{
    let handle = conn.get_interrupt_handle();
    let task = tokio::task::spawn_blocking(move || {
        let result = f(&mut *conn);
        (conn, result)
    });
    // Declared after the task so it fires before an abandoned task's output is dropped.
    let mut interrupt = InterruptOnDrop(Some(handle));
    let output = task.await?;
    interrupt.disarm();
    Ok(output)
}

async fn with_conn<T, F>(pool: &Pool<SqliteManager>, ctx: &Context, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
{
    ctx.run(async {
        let conn = pool.acquire().await?;
        let (_conn, result) = run_blocking(conn, f).await?;
        result
    })
    .await
}

fn query_rows(conn: &rusqlite::Connection, sql: &str, args: &[Value]) -> Result<Rows> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    let mut result_rows = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(from_value_ref(row.get_ref(i)?));
        }
        result_rows.push(values);
    }

    Ok(Rows::new(columns, result_rows))
}

fn exec_statement(conn: &rusqlite::Connection, sql: &str, args: &[Value]) -> Result<ExecResult> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows_affected = stmt.execute(rusqlite::params_from_iter(args.iter()))?;
    Ok(ExecResult::new(rows_affected as u64, Some(conn.last_insert_rowid())))
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b.as_slice())),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
        })
    }
}

/// SQLSTATE class for the SQLite primary result codes that have a PostgreSQL equivalent.
pub fn sqlstate_for(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::CannotOpen => Some("08001"), // sqlclient_unable_to_establish_sqlconnection
        ErrorCode::DiskFull => Some("53100"), // disk_full
        ErrorCode::OutOfMemory => Some("53200"), // out_of_memory
        ErrorCode::ConstraintViolation => Some("23000"), // integrity_constraint_violation
        ErrorCode::ReadOnly => Some("25006"), // read_only_sql_transaction
        ErrorCode::OperationInterrupted => Some("57014"), // query_canceled
        _ => None,
    }
}

impl From<rusqlite::Error> for ResolverError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => ResolverError::NoRows,
            rusqlite::Error::SqliteFailure(failure, _) => ResolverError::Driver {
                code: sqlstate_for(failure.code).map(str::to_string),
                message: err.to_string(),
            },
            _ => ResolverError::driver(err.to_string()),
        }
    }
}
