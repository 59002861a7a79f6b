//! `Client`: a single-connection Supervisor plus its two executors, a query
//! path and a transaction path, both retrying against the same connection.

use std::sync::Arc;
use std::time::Duration;

use resilientpg_core::config::ExecutorConfig;
use resilientpg_core::driver::{Driver, RawConnection, TokioPostgresDriver};
use resilientpg_core::error::{Error, Result};
use resilientpg_core::executor::tx::Statement;
use resilientpg_core::executor::{QueryExecutor, TxExecutor};
use resilientpg_core::supervisor::single::SingleSupervisor;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::config::ResilientPgConfig;

type Rows<D> = Vec<<<D as Driver>::Connection as RawConnection>::Row>;

/// See module docs. Generic over the [`Driver`] so tests can swap in
/// [`resilientpg_core::driver::testing::FakeDriver`]; application code uses
/// the default, `tokio_postgres`-backed driver via [`Client::connect`].
pub struct Client<D: Driver = TokioPostgresDriver<NoTls>> {
    supervisor: Arc<SingleSupervisor<D>>,
    queries: QueryExecutor<Arc<SingleSupervisor<D>>>,
    transactions: TxExecutor<Arc<SingleSupervisor<D>>>,
}

impl Client<TokioPostgresDriver<NoTls>> {
    pub async fn connect(config: ResilientPgConfig, executor: ExecutorConfig) -> Result<Self> {
        config.connect.validate()?;
        let driver = TokioPostgresDriver::new(config.connect.to_tokio_postgres_config(), NoTls);
        let supervisor = SingleSupervisor::connect(driver).await?;
        Ok(Self::from_supervisor(supervisor, executor))
    }
}

impl<D: Driver> Client<D> {
    pub fn from_supervisor(supervisor: Arc<SingleSupervisor<D>>, executor: ExecutorConfig) -> Self {
        Self {
            queries: QueryExecutor::new(Arc::clone(&supervisor), executor),
            transactions: TxExecutor::new(Arc::clone(&supervisor), executor),
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<SingleSupervisor<D>> {
        &self.supervisor
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Rows<D>> {
        self.queries.execute(sql, params).await
    }

    pub async fn transaction(&self, statements: &[Statement<'_>]) -> Result<Vec<Rows<D>>> {
        self.transactions.execute(statements).await
    }

    /// Shuts each owned executor down, then the Supervisor, aggregating any
    /// failures into one composite error.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(Duration::from_secs(30)).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(err) = self.queries.shutdown_with_timeout(timeout).await {
            failures.push(err);
        }
        if let Err(err) = self.transactions.shutdown_with_timeout(timeout).await {
            failures.push(err);
        }
        if let Err(err) = self.supervisor.shutdown().await {
            failures.push(err);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }
}
