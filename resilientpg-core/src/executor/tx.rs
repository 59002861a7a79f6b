//! `TxExecutor`: same retry skeleton as `QueryExecutor`, but each attempt
//! runs a whole `BEGIN ... COMMIT`/`ROLLBACK` batch as a unit.

use std::time::Duration;

use tokio_postgres::types::ToSql;

use crate::backoff;
use crate::config::ExecutorConfig;
use crate::driver::RawConnection;
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

use super::Quiescence;

/// One statement in a transaction batch.
pub struct Statement<'a> {
    pub sql: &'a str,
    pub params: &'a [&'a (dyn ToSql + Sync)],
}

/// See module docs.
pub struct TxExecutor<S: Supervisor> {
    supervisor: S,
    config: ExecutorConfig,
    quiescence: Quiescence,
}

impl<S: Supervisor> TxExecutor<S> {
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

    /// Runs `statements` as a single transaction, retrying the whole batch
    /// on a transient failure. Partial re-execution of a batch is never
    /// attempted.
    pub async fn execute(
        &self,
        statements: &[Statement<'_>],
    ) -> Result<Vec<Vec<<S::Connection as RawConnection>::Row>>> {
        self.quiescence.check_not_shutting_down()?;
        let _guard = self.quiescence.enter();

        let max_attempts = super::attempts(self.config);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            let handle = self.supervisor.acquire().await?;
            match Self::run_once(&handle, statements).await {
                Ok(results) => return Ok(results),
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
                        "transient transaction error, retrying whole batch"
                    );
                    tokio::time::sleep(backoff::delay(attempt, backoff::EXECUTOR_RETRY)).await;
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or(Error::Shutdown))
    }

    async fn run_once(
        handle: &crate::supervisor::Handle<S::Connection>,
        statements: &[Statement<'_>],
    ) -> Result<Vec<Vec<<S::Connection as RawConnection>::Row>>> {
        handle.batch_execute("BEGIN").await?;

        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match handle.execute(statement.sql, statement.params).await {
                Ok(rows) => results.push(rows),
                Err(err) => {
                    rollback(handle).await;
                    return Err(err);
                }
            }
        }

        if let Err(err) = handle.batch_execute("COMMIT").await {
            rollback(handle).await;
            return Err(err);
        }

        Ok(results)
    }

    /// Waits for in-flight transactions to drain before returning; default
    /// 30 s timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(Duration::from_secs(30)).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.quiescence.drain(timeout).await
    }
}

/// Attempts `ROLLBACK`, logging and swallowing any error rather than
/// masking the original failure that triggered it.
async fn rollback<C: RawConnection>(handle: &crate::supervisor::Handle<C>) {
    if let Err(err) = handle.batch_execute("ROLLBACK").await {
        tracing::error!(target: "resilientpg::executor", error = %err, "ROLLBACK failed, swallowing");
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ExecutorConfig;
    use crate::driver::testing::{FakeConnection, FakeDriver};
    use crate::supervisor::single::SingleSupervisor;
    use crate::supervisor::Supervisor;

    use super::{Statement, TxExecutor};

    #[tokio::test]
    async fn a_successful_batch_runs_every_statement_in_order() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let executor = TxExecutor::new(supervisor, ExecutorConfig::new(1));

        let results = executor
            .execute(&[
                Statement { sql: "INSERT INTO t VALUES (1)", params: &[] },
                Statement { sql: "INSERT INTO t VALUES (2)", params: &[] },
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn a_failing_statement_retries_the_whole_batch() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        // The queued transient failure hits BEGIN on the first attempt; the
        // retry re-runs the whole batch against the connection's healthy
        // default and succeeds.
        supervisor.acquire().await.unwrap().push_transient_error();

        let executor = TxExecutor::new(supervisor, ExecutorConfig::new(2));
        let results = executor
            .execute(&[Statement { sql: "UPDATE t SET v = 1", params: &[] }])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn a_non_retriable_statement_failure_rolls_back_and_returns_the_error() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        {
            let handle = supervisor.acquire().await.unwrap();
            handle.push_rows(0); // BEGIN
            handle.push_error(); // the statement itself
        }

        let executor = TxExecutor::new(supervisor, ExecutorConfig::new(3));
        let err = executor
            .execute(&[Statement { sql: "UPDATE t SET v = 1", params: &[] }])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::ProbeFailed(_)));
    }
}
