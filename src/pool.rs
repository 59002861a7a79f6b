//! `Pool`: a pooled Supervisor plus its two executors, a query path and a
//! transaction path, both retrying against the same checked-out connections.

use std::sync::Arc;
use std::time::Duration;

use resilientpg_core::config::{ExecutorConfig, PoolConfig};
use resilientpg_core::driver::{Driver, RawConnection, TokioPostgresDriver};
use resilientpg_core::error::{Error, Result};
use resilientpg_core::executor::tx::Statement;
use resilientpg_core::executor::{QueryExecutor, TxExecutor};
use resilientpg_core::supervisor::pool::PoolSupervisor;
use resilientpg_core::supervisor::Metrics;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::config::ResilientPgConfig;

type Rows<D> = Vec<<<D as Driver>::Connection as RawConnection>::Row>;

/// See module docs.
pub struct Pool<D: Driver = TokioPostgresDriver<NoTls>> {
    supervisor: Arc<PoolSupervisor<D>>,
    queries: QueryExecutor<Arc<PoolSupervisor<D>>>,
    transactions: TxExecutor<Arc<PoolSupervisor<D>>>,
}

impl Pool<TokioPostgresDriver<NoTls>> {
    pub async fn connect(
        config: ResilientPgConfig,
        pool: PoolConfig,
        executor: ExecutorConfig,
    ) -> Result<Self> {
        config.connect.validate()?;
        let driver = TokioPostgresDriver::new(config.connect.to_tokio_postgres_config(), NoTls);
        let supervisor = PoolSupervisor::connect(driver, pool).await?;
        Ok(Self::from_supervisor(supervisor, executor))
    }
}

impl<D: Driver> Pool<D> {
    pub fn from_supervisor(supervisor: Arc<PoolSupervisor<D>>, executor: ExecutorConfig) -> Self {
        Self {
            queries: QueryExecutor::new(Arc::clone(&supervisor), executor),
            transactions: TxExecutor::new(Arc::clone(&supervisor), executor),
            supervisor,
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.supervisor.metrics()
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Rows<D>> {
        self.queries.execute(sql, params).await
    }

    pub async fn transaction(&self, statements: &[Statement<'_>]) -> Result<Vec<Rows<D>>> {
        self.transactions.execute(statements).await
    }

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
