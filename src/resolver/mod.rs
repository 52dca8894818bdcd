//! The logical database: one primary plus an optional read replica behind a single handle.
//!
//! Reads go to the replica and are retried once on the primary when the replica fails with
//! a connection-level error. Writes and transactions always go to the primary. Lifecycle
//! operations fan out to both connections concurrently.

pub mod classifier;
pub mod fanout;
mod statement;
mod tx;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::context::Context;
use crate::driver::{Connection, DriverRegistry, TxOptions};
use crate::pool::PoolStats;
use crate::types::{ExecResult, Row, Rows, Value};
use crate::{ResolverError, Result};

pub use classifier::{DefaultClassifier, ErrorClassifier};
pub use fanout::{fan_out, fan_out_settled};
pub use statement::Stmt;
pub use tx::Tx;

/// Separator between the primary and replica data source names.
pub const DSN_SEPARATOR: char = ';';

pub struct LogicalDb {
    primary: Arc<dyn Connection>,
    replica: Option<Arc<dyn Connection>>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl LogicalDb {
    /// Opens the primary and replica concurrently from `"primary_dsn;replica_dsn"`.
    ///
    /// Descriptors after the second are ignored. An empty second descriptor means there is
    /// no replica. If either open fails, the whole construction fails.
    pub async fn open(
        registry: &DriverRegistry,
        driver_name: &str,
        data_source_names: &str,
    ) -> Result<Self> {
        let driver = registry.get(driver_name)?;
        let mut descriptors = data_source_names.split(DSN_SEPARATOR);
        let primary = descriptors
            .next()
            .filter(|dsn| !dsn.trim().is_empty())
            .ok_or(ResolverError::MissingPrimary)?;
        let mut dsns = vec![primary];
        if let Some(replica) = descriptors.next().filter(|dsn| !dsn.trim().is_empty()) {
            dsns.push(replica);
        }

        debug!("Opening {} {} connection(s)", dsns.len(), driver_name);
        let driver = &driver;
        let dsns = &dsns;
        let mut connections = fan_out(dsns.len(), move |i| driver.open(dsns[i]))
            .await?
            .into_iter();

        let primary = connections.next().ok_or(ResolverError::MissingPrimary)?;
        Ok(Self::wrap(primary, connections.next()))
    }

    /// Wraps connections that are already open.
    pub fn wrap(primary: Arc<dyn Connection>, replica: Option<Arc<dyn Connection>>) -> Self {
        Self {
            primary,
            replica,
            classifier: Arc::new(DefaultClassifier),
        }
    }

    /// Opens the handle from `config`, applies its pool settings and pings it within the
    /// connect timeout.
    pub async fn connect(registry: &DriverRegistry, config: &Config) -> Result<Self> {
        let dsns = config.data_source_names()?;
        let db = Self::open(registry, &config.driver, &dsns).await?;
        db.set_conn_max_lifetime(config.conn_max_lifetime_duration());
        db.set_max_open_conns(config.max_open_conns);
        db.set_max_idle_conns(config.max_idle_conns);

        let ctx = Context::background().with_timeout(config.connect_timeout_duration());
        if let Err(err) = db.ping_context(&ctx).await {
            let _ = db.close().await;
            return Err(err);
        }
        Ok(db)
    }

    /// Replaces the policy that decides when a failed read is retried on the primary.
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn read_write(&self) -> &Arc<dyn Connection> {
        &self.primary
    }

    /// The replica, or the primary when running without one.
    pub fn read_only(&self) -> &Arc<dyn Connection> {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    pub fn replica(&self) -> Option<&Arc<dyn Connection>> {
        self.replica.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        if self.replica.is_some() { 2 } else { 1 }
    }

    pub fn driver_name(&self) -> &str {
        self.primary.driver_name()
    }

    /// Pool statistics, primary first.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.connections().map(|conn| conn.stats()).collect()
    }

    fn connections(&self) -> impl Iterator<Item = &Arc<dyn Connection>> {
        std::iter::once(&self.primary).chain(self.replica.as_ref())
    }

    /// Fan-out slot `i`: 0 is the primary, 1 the replica.
    fn side(&self, i: usize) -> &Arc<dyn Connection> {
        match (i, &self.replica) {
            (0, _) | (_, None) => &self.primary,
            (_, Some(replica)) => replica,
        }
    }

    pub(crate) fn should_fall_back(&self, err: &ResolverError) -> bool {
        self.classifier.is_connection_error(err)
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Rows> {
        self.query_context(&Context::background(), sql, args).await
    }

    pub async fn query_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        let Some(replica) = &self.replica else {
            return self.primary.query(ctx, sql, args).await;
        };
        match replica.query(ctx, sql, args).await {
            Err(err) if self.should_fall_back(&err) => {
                debug!("Replica query failed, falling back to primary: {}", err);
                self.primary.query(ctx, sql, args).await
            }
            result => result,
        }
    }

    pub async fn query_row(&self, sql: &str, args: &[Value]) -> Row {
        self.query_row_context(&Context::background(), sql, args).await
    }

    /// Errors are deferred to the returned [`Row`]; the fallback decision is not.
    pub async fn query_row_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Row {
        let Some(replica) = &self.replica else {
            return self.primary.query_row(ctx, sql, args).await;
        };
        let row = replica.query_row(ctx, sql, args).await;
        if let Some(err) = row.err().filter(|err| self.should_fall_back(err)) {
            debug!("Replica query_row failed, falling back to primary: {}", err);
            return self.primary.query_row(ctx, sql, args).await;
        }
        row
    }

    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.exec_context(&Context::background(), sql, args).await
    }

    pub async fn exec_context(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.primary.exec(ctx, sql, args).await
    }

    /// Starts a transaction on the primary with the driver's default isolation.
    pub async fn begin(&self) -> Result<Tx> {
        self.begin_tx(&Context::background(), &TxOptions::default()).await
    }

    /// Unsupported isolation levels are rejected by the driver.
    pub async fn begin_tx(&self, ctx: &Context, opts: &TxOptions) -> Result<Tx> {
        let inner = self.primary.begin(ctx, opts).await?;
        Ok(Tx::new(inner))
    }

    pub async fn prepare(&self, sql: &str) -> Result<Stmt<'_>> {
        self.prepare_context(&Context::background(), sql).await
    }

    /// Prepares `sql` on every connection concurrently.
    ///
    /// `ctx` covers the preparation only, not later executions of the statement.
    pub async fn prepare_context(&self, ctx: &Context, sql: &str) -> Result<Stmt<'_>> {
        let mut statements = fan_out(self.connection_count(), move |i| self.side(i).prepare(ctx, sql))
            .await?
            .into_iter();
        let primary = statements
            .next()
            .ok_or_else(|| ResolverError::driver("prepare returned no statement"))?;
        Ok(Stmt::new(self, primary, statements.next()))
    }

    /// Pings every connection concurrently and fails if any of them is down.
    pub async fn ping(&self) -> Result<()> {
        let ctx = Context::background();
        let ctx = &ctx;
        fan_out(self.connection_count(), move |i| self.side(i).ping(ctx)).await?;
        Ok(())
    }

    /// Succeeds while at least one connection answers. When none does, the primary's
    /// error is returned.
    pub async fn ping_context(&self, ctx: &Context) -> Result<()> {
        let results = fan_out_settled(self.connection_count(), move |i| self.side(i).ping(ctx)).await;
        if results.iter().any(|result| result.is_ok()) {
            for (i, result) in results.iter().enumerate() {
                if let Err(err) = result {
                    debug!("Ping failed on connection {}: {}", i, err);
                }
            }
            return Ok(());
        }
        results.into_iter().next().unwrap_or(Ok(()))
    }

    /// Closes every connection concurrently. Both are attempted even if one fails.
    pub async fn close(&self) -> Result<()> {
        debug!("Closing {} connection(s)", self.connection_count());
        fan_out(self.connection_count(), move |i| self.side(i).close()).await?;
        Ok(())
    }

    /// Zero means unlimited.
    pub fn set_max_open_conns(&self, n: usize) {
        for conn in self.connections() {
            conn.set_max_open_conns(n);
        }
    }

    /// Zero retains no idle connections.
    pub fn set_max_idle_conns(&self, n: usize) {
        for conn in self.connections() {
            conn.set_max_idle_conns(n);
        }
    }

    /// A zero duration means connections are reused forever.
    pub fn set_conn_max_lifetime(&self, lifetime: Duration) {
        for conn in self.connections() {
            conn.set_conn_max_lifetime(lifetime);
        }
    }
}

impl fmt::Debug for LogicalDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalDb")
            .field("driver", &self.driver_name())
            .field("connections", &self.connection_count())
            .finish()
    }
}
