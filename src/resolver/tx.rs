use crate::context::Context;
use crate::driver::Transaction;
use crate::types::{ExecResult, Row, Rows, Value};
use crate::Result;

/// A transaction on the primary.
///
/// Every statement inside it runs on the primary, reads included. Dropping it without
/// `commit` or `rollback` rolls back by abandoning the connection.
pub struct Tx {
    inner: Box<dyn Transaction>,
}

impl Tx {
    pub(crate) fn new(inner: Box<dyn Transaction>) -> Self {
        Self { inner }
    }

    pub async fn query(&mut self, sql: &str, args: &[Value]) -> Result<Rows> {
        self.inner.query(&Context::background(), sql, args).await
    }

    pub async fn query_context(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Rows> {
        self.inner.query(ctx, sql, args).await
    }

    pub async fn query_row(&mut self, sql: &str, args: &[Value]) -> Row {
        self.inner.query_row(&Context::background(), sql, args).await
    }

    pub async fn query_row_context(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Row {
        self.inner.query_row(ctx, sql, args).await
    }

    pub async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.inner.exec(&Context::background(), sql, args).await
    }

    pub async fn exec_context(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecResult> {
        self.inner.exec(ctx, sql, args).await
    }

    pub async fn commit(self) -> Result<()> {
        self.inner.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await
    }
}
