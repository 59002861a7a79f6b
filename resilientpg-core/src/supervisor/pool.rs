//! The pooled Supervisor variant: an idle-queue plus a size counter and a
//! background reaper, built on `tokio` primitives. Provides checkout, a
//! shared Gate covering "the pool has at least one healthy route", and
//! `idleTimeout`/`maxLifetime` eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::backoff;
use crate::config::PoolConfig;
use crate::driver::{Driver, DriverSignal, RawConnection};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::gate::Gate;
use crate::probe::{self, DEFAULT_TIMEOUT};

use super::{Handle, State, Supervisor};

struct Idle<C> {
    conn: Arc<C>,
    created_at: Instant,
    idle_since: Instant,
}

/// See module docs.
pub struct PoolSupervisor<D: Driver> {
    driver: D,
    config: PoolConfig,
    gate: Gate,
    events: Arc<EventBus>,
    idle: Mutex<VecDeque<Idle<D::Connection>>>,
    size: AtomicU32,
    waiting: AtomicU32,
    permits: Semaphore,
    state: Mutex<State>,
    is_shutting_down: AtomicBool,
    probe_timeout: Duration,
    /// Set once, right after construction, so methods that need to hand an
    /// owned `Arc<Self>` to a spawned task or a release closure can get one
    /// back from a plain `&self`.
    self_ref: OnceLock<Weak<Self>>,
}

impl<D: Driver> PoolSupervisor<D> {
    pub async fn connect(driver: D, config: PoolConfig) -> Result<Arc<Self>> {
        Self::connect_with_timeout(driver, config, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        driver: D,
        config: PoolConfig,
        probe_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;

        let pool = Arc::new(Self {
            driver,
            permits: Semaphore::new(config.max as usize),
            config,
            gate: Gate::new(),
            events: Arc::new(EventBus::new()),
            idle: Mutex::new(VecDeque::new()),
            size: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            state: Mutex::new(State::Connecting),
            is_shutting_down: AtomicBool::new(false),
            probe_timeout,
            self_ref: OnceLock::new(),
        });
        let _ = pool.self_ref.set(Arc::downgrade(&pool));

        // Prove the pool can actually reach the database before returning it
        // to the caller; a connection opened here is immediately idled.
        let (conn, _rx) = pool.driver.connect().await?;
        probe::probe(&conn, pool.probe_timeout).await?;
        pool.size.fetch_add(1, Ordering::AcqRel);
        pool.idle.lock().unwrap().push_back(Idle {
            conn: Arc::new(conn),
            created_at: Instant::now(),
            idle_since: Instant::now(),
        });

        *pool.state.lock().unwrap() = State::Ready;
        pool.gate.open();
        pool.events.emit_connect();

        spawn_reaper(Arc::clone(&pool));

        Ok(pool)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("PoolSupervisor used after being dropped")
    }

    pub fn metrics(&self) -> super::Metrics {
        let total = self.size.load(Ordering::Acquire);
        let idle = self.idle.lock().unwrap().len() as u32;
        super::Metrics {
            total,
            idle,
            active: total.saturating_sub(idle),
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }

    fn should_reap(&self, idle: &Idle<D::Connection>) -> bool {
        let aged_out = self
            .config
            .max_lifetime
            .is_some_and(|max| idle.created_at.elapsed() >= max);
        let idled_out = self
            .config
            .idle_timeout
            .is_some_and(|max| idle.idle_since.elapsed() >= max);
        aged_out || idled_out
    }

    fn release(&self, conn: Arc<D::Connection>, created_at: Instant) {
        if self.is_shutting_down.load(Ordering::Acquire) {
            self.size.fetch_sub(1, Ordering::AcqRel);
            self.permits.add_permits(1);
            return;
        }

        self.idle.lock().unwrap().push_back(Idle {
            conn,
            created_at,
            idle_since: Instant::now(),
        });
        self.permits.add_permits(1);
    }

    /// Checks one connection out of the idle queue, opening a fresh one if
    /// the queue is empty but the pool has headroom (`size < max`). Returns
    /// the connection's original creation time alongside it so a later
    /// `release` can carry it forward instead of re-stamping it.
    async fn checkout(&self) -> Result<(Arc<D::Connection>, Instant)> {
        loop {
            if let Some(idle) = self.idle.lock().unwrap().pop_front() {
                if self.should_reap(&idle) {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                    idle.conn.close().await;
                    continue;
                }
                return Ok((idle.conn, idle.created_at));
            }

            let size = self.size.load(Ordering::Acquire);
            if size < self.config.max {
                if self
                    .size
                    .compare_exchange(size, size + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return self.dial_one().await;
                }
                continue;
            }

            // At capacity with nothing idle: the permit we hold guarantees
            // one will free up, but it may take one more lap to observe it.
            return self.dial_one_after_room().await;
        }
    }

    async fn dial_one(&self) -> Result<(Arc<D::Connection>, Instant)> {
        let connect_timeout = self
            .config
            .connect_timeout
            .unwrap_or(PoolConfig::DEFAULT_CONNECT_TIMEOUT);

        let outcome = tokio::time::timeout(connect_timeout, async {
            let (conn, _rx) = self.driver.connect().await?;
            probe::probe(&conn, self.probe_timeout).await?;
            Ok::<_, Error>(conn)
        })
        .await;

        match outcome {
            Ok(Ok(conn)) => Ok((Arc::new(conn), Instant::now())),
            Ok(Err(err)) => {
                self.size.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
            Err(_elapsed) => {
                self.size.fetch_sub(1, Ordering::AcqRel);
                Err(Error::ProbeTimeout)
            }
        }
    }

    async fn dial_one_after_room(&self) -> Result<(Arc<D::Connection>, Instant)> {
        if let Some(idle) = self.idle.lock().unwrap().pop_front() {
            return Ok((idle.conn, idle.created_at));
        }
        // Nothing idled up yet (race with a sibling checkout); back off once
        // rather than busy-spin, then let the caller's loop retry.
        tokio::time::sleep(Duration::from_millis(1)).await;
        Err(Error::ProbeFailed("no idle connection available yet".into()))
    }

    /// Runs on pool-level or per-client error events: verifies the pool is
    /// still reachable by checking out, probing, and returning a connection.
    async fn verify_or_reconnect(&self, reason: Option<crate::error::Reason>) {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return;
        }

        match self.checkout().await {
            Ok((conn, created_at)) => {
                self.release(conn, created_at);
                tracing::debug!(target: "resilientpg::supervisor", "pool still reachable");
            }
            Err(_) => {
                self.events.emit_disconnect(reason);
                self.gate.close();
                *self.state.lock().unwrap() = State::Reconnecting;

                let mut attempt: u32 = 0;
                loop {
                    if self.is_shutting_down.load(Ordering::Acquire) {
                        return;
                    }
                    attempt += 1;
                    match self.checkout().await {
                        Ok((conn, created_at)) => {
                            self.release(conn, created_at);
                            *self.state.lock().unwrap() = State::Ready;
                            self.gate.open();
                            self.events.emit_reconnect(None);
                            return;
                        }
                        Err(_) => {
                            tokio::time::sleep(backoff::delay(attempt, backoff::RECONNECT)).await;
                        }
                    }
                }
            }
        }
    }
}

fn spawn_reaper<D: Driver>(pool: Arc<PoolSupervisor<D>>) {
    let Some(period) = [pool.config.idle_timeout, pool.config.max_lifetime]
        .into_iter()
        .flatten()
        .min()
    else {
        return;
    };

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if pool.is_shutting_down.load(Ordering::Acquire) {
                return;
            }

            let min_idle = pool.config.min;
            let to_check: Vec<_> = {
                let mut idle = pool.idle.lock().unwrap();
                let keep_at_least = min_idle as usize;
                let mut reap = Vec::new();
                let mut kept = VecDeque::new();
                while let Some(entry) = idle.pop_front() {
                    if pool.should_reap(&entry) && kept.len() >= keep_at_least {
                        reap.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *idle = kept;
                reap
            };

            for entry in to_check {
                entry.conn.close().await;
                pool.size.fetch_sub(1, Ordering::AcqRel);
            }
        }
    });
}

impl<D: Driver> Supervisor for PoolSupervisor<D> {
    type Connection = D::Connection;

    async fn acquire(&self) -> Result<Handle<D::Connection>> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.gate.wait().await.map_err(|reason| (*reason).clone())?;

        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.waiting.fetch_add(1, Ordering::AcqRel);
        let permit = self.permits.acquire().await.map_err(|_| Error::Shutdown)?;
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        permit.forget();

        match self.checkout().await {
            Ok((conn, created_at)) => {
                let pool = self.arc();
                Ok(Handle::pooled(
                    Arc::clone(&conn),
                    Box::new(move || pool.release(conn, created_at)),
                ))
            }
            Err(err) => {
                self.permits.add_permits(1);
                let this = self.arc();
                let reason = err.clone().shared();
                tokio::spawn(async move { this.verify_or_reconnect(Some(reason)).await });
                Err(err)
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        *self.state.lock().unwrap() = State::Destroying;
        self.events.emit_disconnect(None);
        self.gate.close_with_reason(Error::Shutdown);

        let drained: Vec<_> = self.idle.lock().unwrap().drain(..).collect();
        for entry in drained {
            entry.conn.close().await;
            self.size.fetch_sub(1, Ordering::AcqRel);
        }

        *self.state.lock().unwrap() = State::ShutDown;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::driver::testing::{FakeConnection, FakeDriver};
    use crate::supervisor::Supervisor;

    use super::{PoolConfig, PoolSupervisor};

    fn config() -> PoolConfig {
        PoolConfig {
            min: 0,
            max: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_fails_when_the_driver_cannot_reach_the_database() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        driver.push_connect_failure();
        assert!(PoolSupervisor::connect(driver, config()).await.is_err());
    }

    #[tokio::test]
    async fn acquire_checks_out_a_connection_and_metrics_track_it() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let pool = PoolSupervisor::connect(driver, config()).await.unwrap();
        assert_eq!(pool.metrics().total, 1);
        assert_eq!(pool.metrics().idle, 1);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.metrics().idle, 0);
        assert_eq!(pool.metrics().active, 1);

        drop(handle);
        assert_eq!(pool.metrics().idle, 1);
    }

    #[tokio::test]
    async fn pool_grows_beyond_the_initial_connection_up_to_max() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let pool = PoolSupervisor::connect(driver, config()).await.unwrap();

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.metrics().total, 2);
        assert_eq!(pool.metrics().active, 2);

        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn shutdown_drains_idle_connections_and_rejects_new_acquires() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let pool = PoolSupervisor::connect(driver, config()).await.unwrap();

        pool.shutdown().await.unwrap();
        assert_eq!(pool.metrics().idle, 0);
        assert!(pool.acquire().await.is_err());
    }
}
