//! `QueryExecutor`: a Supervisor wrapped with retry.

use std::time::Duration;

use tokio_postgres::types::ToSql;

use crate::backoff;
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

use super::Quiescence;

/// See module docs.
pub struct QueryExecutor<S: Supervisor> {
    supervisor: S,
    config: ExecutorConfig,
    quiescence: Quiescence,
}

impl<S: Supervisor> QueryExecutor<S> {
    pub fn new(supervisor: S, config: ExecutorConfig) -> Self {
        Self {
            supervisor,
            config,
            quiescence: Quiescence::new(),
        }
    }

    pub fn active_requests(&self) -> usize {
        self.quiescence.active_requests()
    }

    /// Fails fast if shutting down, then up to `maxAttempts` tries, retrying
    /// only transient failures with backoff.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<<S::Connection as crate::driver::RawConnection>::Row>> {
        self.quiescence.check_not_shutting_down()?;
        let _guard = self.quiescence.enter();

        let max_attempts = super::attempts(self.config);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            let handle = self.supervisor.acquire().await?;
            match handle.execute(sql, params).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    drop(handle);
                    let is_last = attempt == max_attempts;
                    if is_last || !err.is_retriable() {
                        return Err(err);
                    }
                    tracing::warn!(
                        target: "resilientpg::executor",
                        attempt,
                        error = %err,
                        "transient query error, retrying"
                    );
                    tokio::time::sleep(backoff::delay(attempt, backoff::EXECUTOR_RETRY)).await;
                    last_err = Some(err);
                }
            }
        }

        // Unreachable in practice: the loop always returns on its last
        // iteration. Kept so the function is total without an `unwrap`.
        Err(last_err.unwrap_or(Error::Shutdown))
    }

    /// Waits for in-flight requests to drain before returning; default
    /// 30 s timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(Duration::from_secs(30)).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.quiescence.drain(timeout).await
    }
}
