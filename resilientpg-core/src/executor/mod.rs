//! Retrying request orchestration over a [`Supervisor`].

pub mod query;
pub mod tx;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};

pub use query::QueryExecutor;
pub use tx::TxExecutor;

/// Shared bookkeeping between `QueryExecutor` and `TxExecutor`: an in-flight
/// counter and shutting-down flag, plus the poll-based quiescence wait used
/// by both `shutdown` implementations.
pub(crate) struct Quiescence {
    active: AtomicUsize,
    is_shutting_down: std::sync::atomic::AtomicBool,
}

impl Quiescence {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            is_shutting_down: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn check_not_shutting_down(&self) -> Result<()> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(&self.active)
    }

    pub(crate) fn active_requests(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Sets `isShuttingDown`, polls `activeRequests` at 1 s intervals
    /// logging each change, fails with a timeout error if still positive at
    /// `timeout`.
    pub(crate) async fn drain(&self, timeout: Duration) -> Result<()> {
        self.is_shutting_down.store(true, Ordering::Release);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_seen = self.active_requests();
        if last_seen == 0 {
            tracing::info!(target: "resilientpg::executor", "quiescent immediately, no in-flight requests");
            return Ok(());
        }

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ShutdownTimeout(format!(
                    "timed out waiting for {last_seen} in-flight request(s)"
                )));
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
            let now = self.active_requests();
            if now != last_seen {
                tracing::info!(target: "resilientpg::executor", active = now, "in-flight count changed");
                last_seen = now;
            }
            if now == 0 {
                tracing::info!(target: "resilientpg::executor", "quiescent, shutdown complete");
                return Ok(());
            }
        }
    }
}

pub(crate) struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Retained so both executors share one attempt-count source of truth.
pub(crate) fn attempts(config: ExecutorConfig) -> u32 {
    config.max_attempts.max(1)
}

#[cfg(test)]
mod tests {
    use super::Quiescence;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn entering_and_dropping_a_guard_returns_active_requests_to_zero() {
        let q = Quiescence::new();
        let guard = q.enter();
        assert_eq!(q.active_requests(), 1);
        drop(guard);
        assert_eq!(q.active_requests(), 0);
    }

    #[tokio::test]
    async fn drain_with_no_in_flight_requests_returns_immediately() {
        let q = Quiescence::new();
        q.drain(Duration::from_secs(30)).await.unwrap();
        assert!(q.check_not_shutting_down().is_err());
    }

    #[tokio::test]
    async fn drain_waits_for_an_in_flight_request_to_finish() {
        let q = Arc::new(Quiescence::new());
        let guard_holder = Arc::clone(&q);
        let handle = tokio::spawn(async move {
            let _guard = guard_holder.enter();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        // drain's poll granularity is 1s; by the time it first checks, the
        // spawned request above has already finished and dropped its guard.
        q.drain(Duration::from_secs(5)).await.unwrap();
        handle.await.unwrap();
        assert_eq!(q.active_requests(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_while_a_request_is_still_active() {
        let q = Quiescence::new();
        let _guard = q.enter();
        let err = q.drain(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::ShutdownTimeout(_)));
    }
}
