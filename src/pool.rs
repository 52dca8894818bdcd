//! Bounded connection pool shared by the physical drivers.
//!
//! The pool keeps idle connections on a stack, counts every connection it has handed
//! out or parked, and parks callers on a [`Notify`] once `max_open` is reached.
//! Connections go back to the pool when their [`PooledConnection`] guard drops.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::{ResolverError, Result};

pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Creates and checks physical connections for a [`Pool`].
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Called when a connection is released; broken connections are dropped.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct IdleConnection<C> {
    conn: C,
    created: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    open: usize,
    max_open: usize,
    max_idle: usize,
    max_lifetime: Option<Duration>,
    closed: bool,
}

impl<C> PoolState<C> {
    fn expired(&self, created: Instant) -> bool {
        self.max_lifetime
            .is_some_and(|lifetime| created.elapsed() >= lifetime)
    }

    /// Drops idle connections beyond `max_idle` and returns how many went away.
    fn trim_idle(&mut self) -> usize {
        let mut removed = 0;
        while self.idle.len() > self.max_idle {
            self.idle.pop_front();
            self.open -= 1;
            removed += 1;
        }
        removed
    }
}

struct PoolInner<M: Manager> {
    manager: M,
    state: Mutex<PoolState<M::Connection>>,
    available: Notify,
}

impl<M: Manager> PoolInner<M> {
    fn release(&self, mut conn: M::Connection, created: Instant, broken: bool) {
        let broken = broken || self.manager.has_broken(&mut conn);
        let mut state = self.state.lock();
        if state.closed || broken || state.expired(created) || state.idle.len() >= state.max_idle {
            state.open -= 1;
            drop(state);
            drop(conn);
        } else {
            state.idle.push_back(IdleConnection { conn, created });
            drop(state);
        }
        self.available.notify_one();
    }
}

/// A slot counted in `open` while its connection is being made. Gives the slot back
/// unless filled, including when the connecting future is dropped.
struct Reservation<'a, M: Manager> {
    pool: &'a PoolInner<M>,
    filled: bool,
}

impl<M: Manager> Reservation<'_, M> {
    fn fill(mut self) {
        self.filled = true;
    }
}

impl<M: Manager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.state.lock().open -= 1;
            self.pool.available.notify_one();
        }
    }
}

pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> Pool<M> {
    pub fn new(manager: M) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    open: 0,
                    max_open: 0,
                    max_idle: DEFAULT_MAX_IDLE_CONNS,
                    max_lifetime: None,
                    closed: false,
                }),
                available: Notify::new(),
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Takes an idle connection or opens a new one, waiting while the pool is full.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(ResolverError::Closed);
                }

                while let Some(idle) = state.idle.pop_back() {
                    if state.expired(idle.created) {
                        state.open -= 1;
                        continue;
                    }
                    return Ok(self.wrap(idle.conn, idle.created));
                }

                if state.max_open == 0 || state.open < state.max_open {
                    state.open += 1;
                    break;
                }
            }
            notified.await;
        }

        let slot = Reservation { pool: &self.inner, filled: false };
        let conn = self.inner.manager.connect().await?;
        slot.fill();
        Ok(self.wrap(conn, Instant::now()))
    }

    /// Parks a freshly opened connection as idle without handing it out.
    pub fn seed(&self, conn: M::Connection) {
        self.inner.state.lock().open += 1;
        self.inner.release(conn, Instant::now(), false);
    }

    fn wrap(&self, conn: M::Connection, created: Instant) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            created,
            broken: false,
            pool: self.inner.clone(),
        }
    }

    /// Zero means unlimited. `max_idle` is lowered to match when it exceeds the new limit.
    pub fn set_max_open(&self, n: usize) {
        let mut state = self.inner.state.lock();
        state.max_open = n;
        if n > 0 && state.max_idle > n {
            state.max_idle = n;
        }
        let removed = state.trim_idle();
        drop(state);
        if removed > 0 {
            debug!("Closed {} idle connections after lowering max open", removed);
        }
        self.inner.available.notify_waiters();
    }

    /// Zero retains no idle connections. Capped at `max_open` when that is set.
    pub fn set_max_idle(&self, n: usize) {
        let mut state = self.inner.state.lock();
        state.max_idle = if state.max_open > 0 { n.min(state.max_open) } else { n };
        state.trim_idle();
    }

    /// A zero duration means connections are reused forever.
    pub fn set_max_lifetime(&self, lifetime: Duration) {
        let mut state = self.inner.state.lock();
        state.max_lifetime = (!lifetime.is_zero()).then_some(lifetime);
        let before = state.idle.len();
        let max_lifetime = state.max_lifetime;
        state
            .idle
            .retain(|idle| max_lifetime.is_none_or(|lifetime| idle.created.elapsed() < lifetime));
        let removed = before - state.idle.len();
        state.open -= removed;
    }

    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let drained = state.idle.len();
        state.idle.clear();
        state.open -= drained;
        drop(state);
        self.inner.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            max_open: state.max_open,
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open - state.idle.len(),
        }
    }
}

/// A connection checked out of a [`Pool`]; returns itself on drop.
pub struct PooledConnection<M: Manager> {
    conn: Option<M::Connection>,
    created: Instant,
    broken: bool,
    pool: Arc<PoolInner<M>>,
}

impl<M: Manager> PooledConnection<M> {
    /// Marks the connection as unusable so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// Undoes [`discard`](Self::discard) once an in-flight operation has completed.
    pub fn keep(&mut self) {
        self.broken = false;
    }
}

impl<M: Manager> std::ops::Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: Manager> std::ops::DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.created, self.broken);
        }
    }
}
