#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dbresolver::driver::{Connection, Driver, Statement, Transaction, TxOptions};
use dbresolver::pool::PoolStats;
use dbresolver::{Context, ExecResult, ResolverError, Result, Rows, Value};

/// One recorded call against a mock database.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub sql: String,
    pub args: Vec<Value>,
}

/// A failure the mock reproduces on every matching call until cleared.
#[derive(Debug, Clone)]
pub struct Failure {
    pub code: Option<&'static str>,
    pub message: &'static str,
}

impl Failure {
    pub fn message(message: &'static str) -> Self {
        Self { code: None, message }
    }

    pub fn code(code: &'static str, message: &'static str) -> Self {
        Self {
            code: Some(code),
            message,
        }
    }

    fn to_error(&self) -> ResolverError {
        match self.code {
            Some(code) => ResolverError::with_code(code, self.message),
            None => ResolverError::driver(self.message),
        }
    }
}

#[derive(Default)]
struct Script {
    query: Option<Failure>,
    exec: Option<Failure>,
    prepare: Option<Failure>,
    ping: Option<Failure>,
    close: Option<Failure>,
    stmt_close: Option<Failure>,
    ping_delay: Option<Duration>,
    query_delay: Option<Duration>,
    empty_results: bool,
}

/// In-memory stand-in for a physical database.
///
/// Every query answers one row whose `served_by` column holds the mock's name, so tests
/// can tell which side of a handle answered.
pub struct MockConnection {
    me: Weak<MockConnection>,
    name: String,
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    stats: Mutex<PoolStats>,
    max_idle: Mutex<Option<usize>>,
    max_lifetime: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            stats: Mutex::new(PoolStats::default()),
            max_idle: Mutex::new(None),
            max_lifetime: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fail_queries(&self, failure: Failure) {
        self.script.lock().query = Some(failure);
    }

    pub fn fail_exec(&self, failure: Failure) {
        self.script.lock().exec = Some(failure);
    }

    pub fn fail_prepare(&self, failure: Failure) {
        self.script.lock().prepare = Some(failure);
    }

    pub fn fail_ping(&self, failure: Failure) {
        self.script.lock().ping = Some(failure);
    }

    pub fn fail_close(&self, failure: Failure) {
        self.script.lock().close = Some(failure);
    }

    pub fn fail_statement_close(&self, failure: Failure) {
        self.script.lock().stmt_close = Some(failure);
    }

    pub fn delay_ping(&self, delay: Duration) {
        self.script.lock().ping_delay = Some(delay);
    }

    pub fn delay_queries(&self, delay: Duration) {
        self.script.lock().query_delay = Some(delay);
    }

    pub fn return_no_rows(&self) {
        self.script.lock().empty_results = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|call| call.op).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_idle(&self) -> Option<usize> {
        *self.max_idle.lock()
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        *self.max_lifetime.lock()
    }

    fn record(&self, op: &'static str, sql: &str, args: &[Value]) {
        self.calls.lock().push(Call {
            op,
            sql: sql.to_string(),
            args: args.to_vec(),
        });
    }

    async fn answer(&self, op: &'static str, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        self.record(op, sql, args);
        let (failure, delay, empty) = {
            let script = self.script.lock();
            (script.query.clone(), script.query_delay, script.empty_results)
        };
        ctx.run(async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(failure) = failure {
                return Err(failure.to_error());
            }
            let rows = if empty {
                Vec::new()
            } else {
                vec![vec![Value::Text(self.name.clone())]]
            };
            Ok(Rows::new(vec!["served_by".to_string()], rows))
        })
        .await
    }

    fn write(&self, op: &'static str, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.record(op, sql, args);
        match &self.script.lock().exec {
            Some(failure) => Err(failure.to_error()),
            None => Ok(ExecResult::new(1, None)),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        self.answer("query", ctx, sql, args).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.write("exec", sql, args)
    }

    async fn begin(&self, _ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
        self.record("begin", "", &[]);
        Ok(Box::new(MockTransaction {
            conn: self.self_arc(),
            read_only: opts.read_only,
        }))
    }

    async fn prepare(&self, _ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        self.record("prepare", sql, &[]);
        if let Some(failure) = &self.script.lock().prepare {
            return Err(failure.to_error());
        }
        Ok(Box::new(MockStatement {
            conn: self.self_arc(),
            sql: sql.to_string(),
        }))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        self.record("ping", "", &[]);
        let (failure, delay) = {
            let script = self.script.lock();
            (script.ping.clone(), script.ping_delay)
        };
        ctx.run(async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(failure) => Err(failure.to_error()),
                None => Ok(()),
            }
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.record("close", "", &[]);
        self.closed.store(true, Ordering::SeqCst);
        match &self.script.lock().close {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn set_max_open_conns(&self, n: usize) {
        self.stats.lock().max_open = n;
    }

    fn set_max_idle_conns(&self, n: usize) {
        *self.max_idle.lock() = Some(n);
    }

    fn set_conn_max_lifetime(&self, lifetime: Duration) {
        *self.max_lifetime.lock() = Some(lifetime);
    }

    fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }
}

impl MockConnection {
    /// Statements and transactions record into the connection that created them.
    fn self_arc(&self) -> Arc<MockConnection> {
        self.me.upgrade().expect("mock connection dropped while in use")
    }
}

struct MockStatement {
    conn: Arc<MockConnection>,
    sql: String,
}

#[async_trait]
impl Statement for MockStatement {
    async fn query(&self, ctx: &Context, args: &[Value]) -> Result<Rows> {
        self.conn.answer("stmt_query", ctx, &self.sql, args).await
    }

    async fn exec(&self, _ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        self.conn.write("stmt_exec", &self.sql, args)
    }

    async fn close(&self) -> Result<()> {
        self.conn.record("stmt_close", &self.sql, &[]);
        match &self.conn.script.lock().stmt_close {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

struct MockTransaction {
    conn: Arc<MockConnection>,
    read_only: bool,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        self.conn.answer("tx_query", ctx, sql, args).await
    }

    async fn exec(&mut self, _ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        if self.read_only {
            return Err(ResolverError::with_code("25006", "cannot execute in a read-only transaction"));
        }
        self.conn.write("tx_exec", sql, args)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.conn.record("commit", "", &[]);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.conn.record("rollback", "", &[]);
        Ok(())
    }
}

/// Driver whose data source names are mock names. Names starting with `down` fail to open.
#[derive(Default)]
pub struct MockDriver {
    opened: Mutex<HashMap<String, Arc<MockConnection>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self, dsn: &str) -> Option<Arc<MockConnection>> {
        self.opened.lock().get(dsn).cloned()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>> {
        if dsn.starts_with("down") {
            return Err(ResolverError::with_code(
                "08001",
                format!("could not open {dsn}: connection refused"),
            ));
        }
        let conn = MockConnection::new(dsn);
        self.opened.lock().insert(dsn.to_string(), conn.clone());
        Ok(conn)
    }
}

/// A primary and a replica mock wrapped into one handle.
pub fn primary_and_replica() -> (dbresolver::LogicalDb, Arc<MockConnection>, Arc<MockConnection>) {
    let primary = MockConnection::new("primary");
    let replica = MockConnection::new("replica");
    let db = dbresolver::LogicalDb::wrap(primary.clone(), Some(replica.clone()));
    (db, primary, replica)
}

/// The `served_by` value of the first row.
pub fn served_by(rows: &Rows) -> String {
    rows.get(0)
        .and_then(|row| row.get::<String>(0).ok())
        .unwrap_or_default()
}
