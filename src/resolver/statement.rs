use tracing::debug;

use crate::context::Context;
use crate::driver::Statement;
use crate::resolver::{LogicalDb, fan_out};
use crate::types::{ExecResult, Row, Rows, Value};
use crate::Result;

/// A statement prepared on every connection of a [`LogicalDb`].
///
/// Reads run the replica-side statement and fall back to the primary-side one on a
/// connection failure, exactly like reads on the handle. Writes use the primary side.
/// Close it explicitly; closing the handle does not close its statements.
pub struct Stmt<'db> {
    db: &'db LogicalDb,
    primary: Box<dyn Statement>,
    replica: Option<Box<dyn Statement>>,
}

impl<'db> Stmt<'db> {
    pub(crate) fn new(
        db: &'db LogicalDb,
        primary: Box<dyn Statement>,
        replica: Option<Box<dyn Statement>>,
    ) -> Self {
        Self {
            db,
            primary,
            replica,
        }
    }

    pub fn db(&self) -> &'db LogicalDb {
        self.db
    }

    pub async fn query(&self, args: &[Value]) -> Result<Rows> {
        self.query_context(&Context::background(), args).await
    }

    pub async fn query_context(&self, ctx: &Context, args: &[Value]) -> Result<Rows> {
        let Some(replica) = &self.replica else {
            return self.primary.query(ctx, args).await;
        };
        match replica.query(ctx, args).await {
            Err(err) if self.db.should_fall_back(&err) => {
                debug!("Replica statement failed, falling back to primary: {}", err);
                self.primary.query(ctx, args).await
            }
            result => result,
        }
    }

    pub async fn query_row(&self, args: &[Value]) -> Row {
        self.query_row_context(&Context::background(), args).await
    }

    pub async fn query_row_context(&self, ctx: &Context, args: &[Value]) -> Row {
        let Some(replica) = &self.replica else {
            return self.primary.query_row(ctx, args).await;
        };
        let row = replica.query_row(ctx, args).await;
        if let Some(err) = row.err().filter(|err| self.db.should_fall_back(err)) {
            debug!("Replica statement failed, falling back to primary: {}", err);
            return self.primary.query_row(ctx, args).await;
        }
        row
    }

    pub async fn exec(&self, args: &[Value]) -> Result<ExecResult> {
        self.exec_context(&Context::background(), args).await
    }

    pub async fn exec_context(&self, ctx: &Context, args: &[Value]) -> Result<ExecResult> {
        self.primary.exec(ctx, args).await
    }

    /// Closes both sides concurrently and reports the first failure.
    pub async fn close(&self) -> Result<()> {
        let n = if self.replica.is_some() { 2 } else { 1 };
        fan_out(n, move |i| match (i, &self.replica) {
            (0, _) | (_, None) => self.primary.close(),
            (_, Some(replica)) => replica.close(),
        })
        .await?;
        Ok(())
    }
}
