//! PostgreSQL driver built on tokio-postgres.
//!
//! The data source name is anything `tokio_postgres::Config` parses: a libpq key/value
//! string (`host=db port=5432 user=app dbname=app`) or a `postgres://` URL. Opening only
//! parses it; sockets are established lazily by the pool on first use.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::debug;

use crate::context::Context;
use crate::driver::{Connection, Driver, Statement, Transaction, TxOptions};
use crate::pool::{Manager, Pool, PoolStats, PooledConnection};
use crate::types::{ExecResult, Rows, Value};
use crate::{ResolverError, Result};

type PgPooled = PooledConnection<PostgresManager>;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn open(&self, dsn: &str) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(PostgresConnection::open(dsn)?))
    }
}

pub struct PostgresManager {
    config: tokio_postgres::Config,
}

#[async_trait]
impl Manager for PostgresManager {
    type Connection = Client;

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Postgres connection terminated: {}", e);
            }
        });
        Ok(client)
    }

    fn has_broken(&self, client: &mut Client) -> bool {
        client.is_closed()
    }
}

pub struct PostgresConnection {
    pool: Pool<PostgresManager>,
}

impl PostgresConnection {
    pub fn open(dsn: &str) -> Result<Self> {
        let config: tokio_postgres::Config = dsn.parse()?;
        Ok(Self {
            pool: Pool::new(PostgresManager { config }),
        })
    }
}

fn bind(args: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

async fn query_on(client: &mut PgPooled, sql: &str, args: &[Value]) -> Result<Rows> {
    // Abandoning the call mid-flight leaves the socket in an unknown state.
    client.discard();
    let result = async {
        let statement = client.prepare(sql).await?;
        let rows = client.query(&statement, &bind(args)).await?;
        Ok::<_, tokio_postgres::Error>((statement, rows))
    }
    .await;
    client.keep();

    let (statement, rows) = result?;
    let columns = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let mut result_rows = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut values = Vec::with_capacity(row.len());
        for i in 0..row.len() {
            values.push(decode_value(row, i)?);
        }
        result_rows.push(values);
    }
    Ok(Rows::new(columns, result_rows))
}

async fn exec_on(client: &mut PgPooled, sql: &str, args: &[Value]) -> Result<ExecResult> {
    client.discard();
    let result = client.execute(sql, &bind(args)).await;
    client.keep();
    Ok(ExecResult::new(result?, None))
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgres"
    }

    async fn query(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            query_on(&mut client, sql, args).await
        })
        .await
    }

    async fn exec(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            exec_on(&mut client, sql, args).await
        })
        .await
    }

    async fn begin(&self, ctx: &Context, opts: &TxOptions) -> Result<Box<dyn Transaction>> {
        let mut sql = String::from("BEGIN");
        if let Some(level) = opts.isolation.as_sql() {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level);
        }
        if opts.read_only {
            sql.push_str(" READ ONLY");
        }

        let client = ctx
            .run(async {
                let mut client = self.pool.acquire().await?;
                client.discard();
                client.batch_execute(&sql).await?;
                client.keep();
                Ok(client)
            })
            .await?;

        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Box<dyn Statement>> {
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            client.discard();
            client.prepare(sql).await?;
            client.keep();
            Ok(())
        })
        .await?;

        Ok(Box::new(PostgresStatement {
            pool: self.pool.clone(),
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            client.discard();
            client.simple_query("SELECT 1").await?;
            client.keep();
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

/// Re-prepared on whichever pooled client runs it.
struct PostgresStatement {
    pool: Pool<PostgresManager>,
    sql: String,
    closed: AtomicBool,
}

impl PostgresStatement {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ResolverError::StmtClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Statement for PostgresStatement {
    async fn query(&self, ctx: &Context, args: &[Value]) -> Result<Rows> {
        self.check_open()?;
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            query_on(&mut client, &self.sql, args).await
        })
        .await
    }

    async fn exec(&self, ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        self.check_open()?;
        ctx.run(async {
            let mut client = self.pool.acquire().await?;
            exec_on(&mut client, &self.sql, args).await
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct PostgresTransaction {
    client: Option<PgPooled>,
}

impl PostgresTransaction {
    fn client(&mut self) -> Result<&mut PgPooled> {
        self.client.as_mut().ok_or(ResolverError::TxDone)
    }

    async fn finish(&mut self, sql: &str) -> Result<()> {
        let mut client = self.client.take().ok_or(ResolverError::TxDone)?;
        client.discard();
        client.batch_execute(sql).await?;
        client.keep();
        Ok(())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn query(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        ctx.run(async {
            let client = self.client()?;
            query_on(client, sql, args).await
        })
        .await
    }

    async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.run(async {
            let client = self.client()?;
            exec_on(client, sql, args).await
        })
        .await
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

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.discard();
        }
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::from(*i).to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            Value::Real(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else if *ty == Type::NUMERIC {
                    Decimal::try_from(*f)?.to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            Value::Text(s) => s.to_sql(ty, out),
            Value::Blob(b) => b.to_sql(ty, out),
            Value::Bool(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

fn decode_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Integer(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Integer(v.into()))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Real(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Real)
    } else if *ty == Type::NUMERIC {
        row.try_get::<_, Option<Decimal>>(idx)?.map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Blob)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Text(v.to_rfc3339()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?.map(|v| Value::Text(v.to_string()))
    } else if <String as FromSql<'_>>::accepts(ty) {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    } else {
        return Err(ResolverError::TypeConversion(format!(
            "unsupported postgres type {} in column {}",
            ty,
            row.columns()[idx].name()
        )));
    };

    Ok(value.unwrap_or(Value::Null))
}

/// SQLSTATE for transport failures that carry no server error code.
fn transport_sqlstate(err: &tokio_postgres::Error) -> Option<&'static str> {
    if err.is_closed() {
        return Some("08003"); // connection_does_not_exist
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            return match io.kind() {
                ErrorKind::ConnectionRefused => Some("08001"),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof
                | ErrorKind::TimedOut => Some("08006"), // connection_failure
                _ => None,
            };
        }
        source = cause.source();
    }
    None
}

impl From<tokio_postgres::Error> for ResolverError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => ResolverError::Driver {
                code: Some(db.code().code().to_string()),
                message: format!("{}: {}", db.severity(), db.message()),
            },
            None => ResolverError::Driver {
                code: transport_sqlstate(&err).map(str::to_string),
                message: err.to_string(),
            },
        }
    }
}
