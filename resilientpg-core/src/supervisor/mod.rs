//! The connection-lifecycle state machine: single-connection and pooled
//! variants sharing one contract so [`crate::executor`] and [`crate::notify`]
//! never need to know which one they're driving.

pub mod pool;
pub mod single;

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use crate::driver::RawConnection;
use crate::error::Result;

pub use pool::PoolSupervisor;
pub use single::SingleSupervisor;

/// The `{Idle, Connecting, Ready, Reconnecting, Destroying, ShutDown}`
/// connection lifecycle, shared by both Supervisor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Ready,
    Reconnecting,
    Destroying,
    ShutDown,
}

/// Aggregate counters reported by [`Supervisor::metrics`] on pooled
/// supervisors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub total: u32,
    pub idle: u32,
    pub active: u32,
    pub waiting: u32,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A connection checked out from a [`Supervisor`]. Single-connection mode
/// hands back the same handle every time and releasing it is a no-op;
/// pooled mode returns the underlying connection to the idle set on drop.
pub struct Handle<C> {
    conn: Arc<C>,
    release: Option<ReleaseFn>,
}

impl<C> Handle<C> {
    pub(crate) fn unpooled(conn: Arc<C>) -> Self {
        Self { conn, release: None }
    }

    pub(crate) fn pooled(conn: Arc<C>, release: ReleaseFn) -> Self {
        Self {
            conn,
            release: Some(release),
        }
    }
}

impl<C> Deref for Handle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> Drop for Handle<C> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// The public contract common to both Supervisor variants.
pub trait Supervisor: Send + Sync + 'static {
    type Connection: RawConnection;

    /// Rejects immediately with [`crate::error::Error::Shutdown`] if
    /// shutting down; otherwise waits on the Gate, re-checks shutdown, then
    /// returns a live handle.
    fn acquire(&self) -> impl Future<Output = Result<Handle<Self::Connection>>> + Send + '_;

    /// Marks shutting-down, emits `disconnect`, closes the Gate with a
    /// shutdown reason, then destroys the underlying resource. Idempotent.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send + '_;
}

/// Lets `QueryExecutor`/`TxExecutor`/facade types share one Supervisor via a
/// cheap `Arc` clone instead of each needing their own.
impl<T: Supervisor> Supervisor for Arc<T> {
    type Connection = T::Connection;

    async fn acquire(&self) -> Result<Handle<T::Connection>> {
        (**self).acquire().await
    }

    async fn shutdown(&self) -> Result<()> {
        (**self).shutdown().await
    }
}
