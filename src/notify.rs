//! `NotificationClient`: a single-connection Supervisor plus a
//! `NotificationManager`, with a `QueryExecutor` alongside it for issuing
//! ordinary commands on that same connection.

use std::sync::Arc;

use resilientpg_core::config::ExecutorConfig;
use resilientpg_core::driver::{Driver, RawConnection, TokioPostgresDriver};
use resilientpg_core::error::{Error, Result};
use resilientpg_core::executor::QueryExecutor;
use resilientpg_core::notify::{Callbacks, NotificationManager};
use resilientpg_core::supervisor::single::SingleSupervisor;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::config::ResilientPgConfig;

type Rows<D> = Vec<<<D as Driver>::Connection as RawConnection>::Row>;

/// See module docs. The `QueryExecutor` shares the same connection the
/// `NotificationManager` listens on, so ordinary queries and `LISTEN`ed
/// channels survive the same reconnects together.
pub struct NotificationClient<D: Driver = TokioPostgresDriver<NoTls>> {
    supervisor: Arc<SingleSupervisor<D>>,
    manager: Arc<NotificationManager<D>>,
    queries: QueryExecutor<Arc<SingleSupervisor<D>>>,
}

impl NotificationClient<TokioPostgresDriver<NoTls>> {
    pub async fn connect(config: ResilientPgConfig, executor: ExecutorConfig) -> Result<Self> {
        config.connect.validate()?;
        let driver = TokioPostgresDriver::new(config.connect.to_tokio_postgres_config(), NoTls);
        let supervisor = SingleSupervisor::connect(driver).await?;
        Ok(Self::from_supervisor(supervisor, executor))
    }
}

impl<D: Driver> NotificationClient<D> {
    pub fn from_supervisor(supervisor: Arc<SingleSupervisor<D>>, executor: ExecutorConfig) -> Self {
        Self {
            queries: QueryExecutor::new(Arc::clone(&supervisor), executor),
            manager: NotificationManager::new(Arc::clone(&supervisor)),
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<SingleSupervisor<D>> {
        &self.supervisor
    }

    pub async fn listen(&self, channel: impl Into<String>, callbacks: Callbacks) -> Result<()> {
        self.manager.listen(channel, callbacks).await
    }

    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        self.manager.unlisten(channel).await
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Rows<D>> {
        self.queries.execute(sql, params).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(err) = self.queries.shutdown().await {
            failures.push(err);
        }
        if let Err(err) = self.manager.shutdown().await {
            failures.push(err);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(failures))
        }
    }
}
