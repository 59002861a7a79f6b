//! The readiness gate: a single-shot, reusable barrier that suspends callers
//! while the underlying connection is unusable and either releases them or
//! fails them once its state is known.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use event_listener::Event;

use crate::error::{Error, Reason};

#[derive(Debug, Clone)]
enum Status {
    Open,
    /// A silent close (a reconnect blip): waiters stay parked and are
    /// released by the next `open()`, never failed.
    Closed,
    /// A reasoned close (shutdown): every current waiter fails with `reason`.
    /// Terminal in practice (the only caller that closes with a reason is
    /// Supervisor::shutdown, and a gate is never reopened afterwards).
    Failed(Reason),
}

/// See module docs. Cloning a `Gate` shares the same underlying state.
#[derive(Clone)]
pub struct Gate {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    status: Mutex<Status>,
    waiters: AtomicUsize,
    event: Event,
}

impl Gate {
    /// A new gate is created closed.
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                status: Mutex::new(Status::Closed),
                waiters: AtomicUsize::new(0),
                event: Event::new(),
            }),
        }
    }

    /// Number of callers currently parked in [`Gate::wait`].
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.inner.status.lock().unwrap(), Status::Open)
    }

    /// Releases all current waiters. Idempotent while already open. Resets
    /// the gate so a subsequent `close()` starts a fresh waiter cycle.
    pub fn open(&self) -> usize {
        let mut status = self.inner.status.lock().unwrap();
        if matches!(*status, Status::Open) {
            return 0;
        }
        *status = Status::Open;
        drop(status);

        let released = self.waiters();
        self.inner.event.notify(usize::MAX);
        released
    }

    /// Silently closes the gate: existing waiters stay parked and will be
    /// released (not failed) by the next `open()`. New callers to `wait()`
    /// queue behind them. Idempotent on an already-closed, waiter-free gate.
    pub fn close(&self) -> usize {
        let mut status = self.inner.status.lock().unwrap();
        match *status {
            Status::Open | Status::Closed => {
                *status = Status::Closed;
                0
            }
            Status::Failed(_) => 0,
        }
    }

    /// Closes the gate with a reason: every current waiter fails with it.
    pub fn close_with_reason(&self, reason: Error) -> usize {
        let reason: Reason = reason.into();
        let mut status = self.inner.status.lock().unwrap();
        *status = Status::Failed(reason);
        drop(status);

        let failed = self.waiters();
        self.inner.event.notify(usize::MAX);
        failed
    }

    /// Completes immediately if open; otherwise parks until the gate opens
    /// or is closed with a reason.
    pub async fn wait(&self) -> Result<(), Reason> {
        self.inner.waiters.fetch_add(1, Ordering::AcqRel);
        let _decrement_on_exit = WaiterGuard(&self.inner.waiters);

        loop {
            // Register for the next notification *before* inspecting status,
            // so an open()/close_with_reason() racing with us can't be missed.
            let listener = self.inner.event.listen();

            match &*self.inner.status.lock().unwrap() {
                Status::Open => return Ok(()),
                Status::Failed(reason) => return Err(reason.clone()),
                Status::Closed => {}
            }

            listener.await;
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_releases_waiters_immediately() {
        let gate = Gate::new();
        gate.open();
        tokio::time::timeout(Duration::from_millis(50), gate.wait())
            .await
            .expect("should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn silent_close_parks_then_releases_on_open() {
        let gate = Gate::new();
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.waiters(), 1);

        gate.open();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reasoned_close_fails_current_waiters() {
        let gate = Gate::new();
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.wait().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close_with_reason(Error::Shutdown);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(*err, Error::Shutdown));
    }

    #[tokio::test]
    async fn cancelling_a_waiter_decrements_the_count() {
        let gate = Gate::new();
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.waiters(), 1);

        waiter.abort();
        let _ = waiter.await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.waiters(), 0);
    }

    #[test]
    fn double_open_is_idempotent() {
        let gate = Gate::new();
        gate.open();
        assert!(gate.is_open());
        assert_eq!(gate.open(), 0);
    }
}
