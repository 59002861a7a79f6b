//! The single-connection Supervisor variant: one handle, reused by every
//! `acquire()` call, kept alive across reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::backoff;
use crate::driver::{Driver, DriverSignal, RawConnection};
use crate::error::{Error, Reason, Result};
use crate::events::EventBus;
use crate::gate::Gate;
use crate::probe::{self, DEFAULT_TIMEOUT};

use super::{Handle, State, Supervisor};

/// See module docs.
pub struct SingleSupervisor<D: Driver> {
    driver: D,
    gate: Gate,
    events: Arc<EventBus>,
    handle: Mutex<Option<Arc<D::Connection>>>,
    state: Mutex<State>,
    is_shutting_down: AtomicBool,
    shutdown_notify: Notify,
    probe_timeout: Duration,
}

impl<D: Driver> SingleSupervisor<D> {
    /// Performs the initial connect synchronously: a failure here is fatal
    /// and propagated to the caller; everything past that point runs in a
    /// background task and routes failures into the reconnect loop instead
    /// of ever failing the caller.
    pub async fn connect(driver: D) -> Result<Arc<Self>> {
        Self::connect_with_timeout(driver, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(driver: D, probe_timeout: Duration) -> Result<Arc<Self>> {
        let (conn, rx) = driver.connect().await?;

        let supervisor = Arc::new(Self {
            driver,
            gate: Gate::new(),
            events: Arc::new(EventBus::new()),
            handle: Mutex::new(None),
            state: Mutex::new(State::Connecting),
            is_shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            probe_timeout,
        });

        match probe::probe(&conn, supervisor.probe_timeout).await {
            Ok(()) => {
                *supervisor.handle.lock().unwrap() = Some(Arc::new(conn));
                *supervisor.state.lock().unwrap() = State::Ready;
                supervisor.gate.open();
                supervisor.events.emit_connect();
                tokio::spawn(Arc::clone(&supervisor).run(rx));
            }
            Err(err) => {
                tracing::warn!(target: "resilientpg::supervisor", error = %err, "initial probe failed, entering reconnect loop");
                *supervisor.state.lock().unwrap() = State::Reconnecting;
                tokio::spawn(Arc::clone(&supervisor).run_from_reconnect());
            }
        }

        Ok(supervisor)
    }

    /// Subscribes to lifecycle events (`connect`, `disconnect`, `reconnect`,
    /// `notification`). Exposed for [`crate::notify::NotificationManager`]
    /// and application code alike; see [`EventBus`] for replace-on-resubscribe
    /// semantics.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    async fn run_from_reconnect(self: Arc<Self>) {
        if let Some(rx) = self.reconnect_loop().await {
            self.run(rx).await;
        }
    }

    async fn run(self: Arc<Self>, mut signal_rx: mpsc::UnboundedReceiver<DriverSignal>) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_notify.notified() => return,

                signal = signal_rx.recv() => match signal {
                    Some(DriverSignal::Notification { channel, payload }) => {
                        self.events.emit_notification(&channel, &payload);
                    }
                    Some(DriverSignal::Error(err)) => {
                        let reason: Reason = Error::Driver(err).shared();
                        match self.verify_or_reconnect(reason).await {
                            VerifyOutcome::StillAlive => {}
                            VerifyOutcome::Reconnected(rx) => signal_rx = rx,
                            VerifyOutcome::ShuttingDown => return,
                        }
                    }
                    Some(DriverSignal::End) | None => {
                        self.events.emit_disconnect(None);
                        self.gate.close();
                        *self.state.lock().unwrap() = State::Reconnecting;
                        match self.reconnect_loop().await {
                            Some(rx) => signal_rx = rx,
                            None => return,
                        }
                    }
                },
            }
        }
    }

    /// Probes the current handle on a driver `error` event rather than
    /// assuming the connection is dead.
    async fn verify_or_reconnect(&self, reason: Reason) -> VerifyOutcome {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return VerifyOutcome::ShuttingDown;
        }

        let current = self.handle.lock().unwrap().clone();
        let Some(conn) = current else {
            return self.start_reconnect(Some(reason)).await;
        };

        match probe::probe(&*conn, self.probe_timeout).await {
            Ok(()) => {
                tracing::debug!(target: "resilientpg::supervisor", %reason, "connection still alive");
                VerifyOutcome::StillAlive
            }
            Err(_) => self.start_reconnect(Some(reason)).await,
        }
    }

    async fn start_reconnect(&self, reason: Option<Reason>) -> VerifyOutcome {
        self.events.emit_disconnect(reason);
        self.gate.close();
        *self.state.lock().unwrap() = State::Reconnecting;
        match self.reconnect_loop().await {
            Some(rx) => VerifyOutcome::Reconnected(rx),
            None => VerifyOutcome::ShuttingDown,
        }
    }

    /// Unbounded reconnect attempts with bounded-jittered backoff between
    /// them, aborted the instant shutdown is observed.
    async fn reconnect_loop(&self) -> Option<mpsc::UnboundedReceiver<DriverSignal>> {
        let mut attempt: u32 = 0;
        loop {
            if self.is_shutting_down.load(Ordering::Acquire) {
                return None;
            }
            attempt += 1;
            *self.handle.lock().unwrap() = None;

            if let Ok((conn, rx)) = self.driver.connect().await {
                if probe::probe(&conn, self.probe_timeout).await.is_ok() {
                    *self.handle.lock().unwrap() = Some(Arc::new(conn));
                    *self.state.lock().unwrap() = State::Ready;
                    self.gate.open();
                    self.events.emit_reconnect(None);
                    return Some(rx);
                }
            }

            if self.is_shutting_down.load(Ordering::Acquire) {
                return None;
            }
            tokio::time::sleep(backoff::delay(attempt, backoff::RECONNECT)).await;
        }
    }
}

enum VerifyOutcome {
    StillAlive,
    Reconnected(mpsc::UnboundedReceiver<DriverSignal>),
    ShuttingDown,
}

impl<D: Driver> Supervisor for SingleSupervisor<D> {
    type Connection = D::Connection;

    async fn acquire(&self) -> Result<Handle<D::Connection>> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        self.gate.wait().await.map_err(|reason| (*reason).clone())?;

        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let conn = self.handle.lock().unwrap().clone().ok_or(Error::Shutdown)?;
        Ok(Handle::unpooled(conn))
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        *self.state.lock().unwrap() = State::Destroying;
        self.events.emit_disconnect(None);
        self.gate.close_with_reason(Error::Shutdown);
        self.shutdown_notify.notify_waiters();

        if let Some(conn) = self.handle.lock().unwrap().take() {
            conn.close().await;
        }

        *self.state.lock().unwrap() = State::ShutDown;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::driver::testing::{FakeConnection, FakeDriver};
    use crate::driver::DriverSignal;
    use crate::supervisor::{State, Supervisor};

    use super::SingleSupervisor;

    #[tokio::test]
    async fn initial_connect_failure_is_fatal() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        driver.push_connect_failure();
        assert!(SingleSupervisor::connect(driver).await.is_err());
    }

    #[tokio::test]
    async fn acquire_succeeds_against_a_healthy_connection() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        assert_eq!(supervisor.state(), State::Ready);
        supervisor.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn a_clean_end_signal_triggers_reconnect_and_recovers() {
        let driver = std::sync::Arc::new(FakeDriver::always_succeeds(FakeConnection::healthy));
        let supervisor = SingleSupervisor::connect(std::sync::Arc::clone(&driver))
            .await
            .unwrap();

        let (tx, mut reconnected) = tokio::sync::mpsc::unbounded_channel();
        supervisor.events().on_reconnect(move |_| {
            let _ = tx.send(());
        });

        // Simulate the peer closing the connection cleanly, as
        // `TokioPostgresDriver` would report via its background poll loop.
        driver.inject(DriverSignal::End);

        tokio::time::timeout(Duration::from_secs(2), reconnected.recv())
            .await
            .expect("should reconnect before the timeout")
            .expect("channel should not close");
        assert_eq!(supervisor.state(), State::Ready);
        supervisor.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_rejected() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        supervisor.shutdown().await.unwrap();
        assert!(supervisor.acquire().await.is_err());
        assert_eq!(supervisor.state(), State::ShutDown);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        supervisor.shutdown().await.unwrap();
        supervisor.shutdown().await.unwrap();
    }
}
