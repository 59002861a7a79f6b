//! `NotificationManager`: durable `LISTEN`/`NOTIFY` subscriptions on top of a
//! single-connection Supervisor. Pooled clients don't get one: a
//! notification session has to be a dedicated connection.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::supervisor::single::SingleSupervisor;
use crate::supervisor::Supervisor;

/// What a subscriber hears about its channel.
#[derive(Default)]
pub struct Callbacks {
    pub on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_data: Option<Box<dyn Fn(NotificationPayload) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(Error) + Send + Sync>>,
}

/// A `NOTIFY` payload, parsed as JSON when possible.
pub enum NotificationPayload {
    Json(serde_json::Value),
    Raw(String),
}

struct Subscription {
    callbacks: Arc<Callbacks>,
}

/// See module docs.
pub struct NotificationManager<D: Driver> {
    supervisor: Arc<SingleSupervisor<D>>,
    /// Ordered (insertion order) channel -> subscription mapping.
    subscriptions: Mutex<Vec<(String, Subscription)>>,
    is_shutting_down: AtomicBool,
}

impl<D: Driver> NotificationManager<D> {
    pub fn new(supervisor: Arc<SingleSupervisor<D>>) -> Arc<Self> {
        let manager = Arc::new(Self {
            supervisor,
            subscriptions: Mutex::new(Vec::new()),
            is_shutting_down: AtomicBool::new(false),
        });
        manager.wire_events();
        manager
    }

    fn wire_events(self: &Arc<Self>) {
        let events = self.supervisor.events();

        let on_reconnect = Arc::clone(self);
        events.on_reconnect(move |_reason| {
            let manager = Arc::clone(&on_reconnect);
            tokio::spawn(async move { manager.resubscribe_all().await });
        });

        let on_disconnect = Arc::clone(self);
        events.on_disconnect(move |_reason| {
            on_disconnect.notify_all_disconnected();
        });

        let on_notification = Arc::clone(self);
        events.on_notification(move |channel, payload| {
            on_notification.dispatch(channel, payload);
        });
    }

    /// Rejects if shutting down or already mapped, otherwise issues
    /// `LISTEN "channel"` and invokes `onConnect`.
    pub async fn listen(&self, channel: impl Into<String>, callbacks: Callbacks) -> Result<()> {
        if self.is_shutting_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let channel = channel.into();
        let callbacks = Arc::new(callbacks);

        {
            let mut subs = self.subscriptions.lock().unwrap();
            if subs.iter().any(|(name, _)| *name == channel) {
                return Err(Error::Validation(format!(
                    "already listening on channel {channel:?}"
                )));
            }
            subs.push((
                channel.clone(),
                Subscription {
                    callbacks: Arc::clone(&callbacks),
                },
            ));
        }

        let handle = self.supervisor.acquire().await?;
        let sql = format!("LISTEN {}", quote_ident(&channel));
        if let Err(err) = handle.batch_execute(&sql).await {
            self.subscriptions
                .lock()
                .unwrap()
                .retain(|(name, _)| *name != channel);
            return Err(err);
        }
        drop(handle);

        invoke0(&callbacks.on_connect);
        Ok(())
    }

    /// Removes the mapping and issues a best-effort `UNLISTEN`.
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        let callbacks = {
            let mut subs = self.subscriptions.lock().unwrap();
            let index = subs.iter().position(|(name, _)| name == channel);
            match index {
                Some(i) => subs.remove(i).1.callbacks,
                None => {
                    return Err(Error::Validation(format!(
                        "not listening on channel {channel:?}"
                    )))
                }
            }
        };

        let sql = format!("UNLISTEN {}", quote_ident(channel));
        match self.supervisor.acquire().await {
            Ok(handle) => {
                if let Err(err) = handle.batch_execute(&sql).await {
                    tracing::warn!(target: "resilientpg::notify", channel, error = %err, "UNLISTEN failed, swallowing");
                }
            }
            Err(err) => {
                tracing::warn!(target: "resilientpg::notify", channel, error = %err, "UNLISTEN skipped, no handle");
            }
        }

        invoke0(&callbacks.on_disconnect);
        Ok(())
    }

    /// On Supervisor reconnect: re-issues `LISTEN` for every mapping in
    /// iteration order; per-channel failures call `onError` but don't stop
    /// the rest.
    async fn resubscribe_all(&self) {
        let snapshot: Vec<(String, Arc<Callbacks>)> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(name, sub)| (name.clone(), Arc::clone(&sub.callbacks)))
            .collect();

        for (channel, callbacks) in snapshot {
            let handle = match self.supervisor.acquire().await {
                Ok(handle) => handle,
                Err(err) => {
                    invoke1(&callbacks.on_error, err);
                    continue;
                }
            };

            let sql = format!("LISTEN {}", quote_ident(&channel));
            match handle.batch_execute(&sql).await {
                Ok(()) => invoke0(&callbacks.on_connect),
                Err(err) => invoke1(&callbacks.on_error, err),
            }
        }
    }

    fn notify_all_disconnected(&self) {
        let snapshot: Vec<Arc<Callbacks>> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sub)| Arc::clone(&sub.callbacks))
            .collect();

        for callbacks in snapshot {
            invoke0(&callbacks.on_disconnect);
        }
    }

    /// On Supervisor notification: parses JSON when possible, routes a
    /// panicking `onData` to `onError`.
    fn dispatch(&self, channel: &str, payload: &str) {
        let callbacks = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .find(|(name, _)| name == channel)
                .map(|(_, sub)| Arc::clone(&sub.callbacks))
        };
        let Some(callbacks) = callbacks else {
            return;
        };

        let parsed = match serde_json::from_str(payload) {
            Ok(value) => NotificationPayload::Json(value),
            Err(_) => NotificationPayload::Raw(payload.to_owned()),
        };

        let Some(on_data) = callbacks.on_data.as_ref() else {
            return;
        };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| on_data(parsed)));
        if let Err(panic) = result {
            let message = crate::events::panic_message(&panic);
            invoke1(
                &callbacks.on_error,
                Error::Validation(format!("onData panicked: {message}")),
            );
        }
    }

    /// Flags shutting-down, delegates to the Supervisor, clears the
    /// subscription map.
    pub async fn shutdown(&self) -> Result<()> {
        self.is_shutting_down.store(true, Ordering::Release);
        let result = self.supervisor.shutdown().await;
        self.subscriptions.lock().unwrap().clear();
        result
    }
}

/// Invokes an optional zero-argument callback outside any lock, swallowing
/// any panic so one subscriber can never take down another.
fn invoke0(callback: &Option<impl Fn() + Send + Sync>) {
    let Some(callback) = callback else {
        return;
    };
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback()));
    if let Err(panic) = result {
        let message = crate::events::panic_message(&panic);
        tracing::error!(target: "resilientpg::notify", "subscription callback panicked: {message}");
    }
}

/// Same as [`invoke0`], for the single-argument `onError` callback.
fn invoke1<A>(callback: &Option<impl Fn(A) + Send + Sync>, arg: A) {
    let Some(callback) = callback else {
        return;
    };
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(arg)));
    if let Err(panic) = result {
        let message = crate::events::panic_message(&panic);
        tracing::error!(target: "resilientpg::notify", "subscription callback panicked: {message}");
    }
}

/// Double-quotes `name` for use in `LISTEN`/`UNLISTEN`, doubling any
/// embedded quote per Postgres identifier-quoting rules. Channel names are
/// always double-quoted in the emitted SQL to preserve case sensitivity.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::driver::testing::{FakeConnection, FakeDriver};

    use super::*;

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("weird\"channel"), "\"weird\"\"channel\"");
    }

    fn recording_callbacks() -> (Callbacks, mpsc::UnboundedReceiver<NotificationPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = Callbacks {
            on_data: Some(Box::new(move |payload| {
                let _ = tx.send(payload);
            })),
            ..Default::default()
        };
        (callbacks, rx)
    }

    #[tokio::test]
    async fn a_json_payload_is_parsed_before_reaching_on_data() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let manager = NotificationManager::new(supervisor);
        let (callbacks, mut rx) = recording_callbacks();

        manager.listen("orders", callbacks).await.unwrap();
        manager.dispatch("orders", "{\"id\":1}");

        match rx.recv().await.unwrap() {
            NotificationPayload::Json(value) => assert_eq!(value["id"], 1),
            NotificationPayload::Raw(_) => panic!("expected a parsed JSON payload"),
        }
    }

    #[tokio::test]
    async fn a_non_json_payload_is_delivered_raw() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let manager = NotificationManager::new(supervisor);
        let (callbacks, mut rx) = recording_callbacks();

        manager.listen("orders", callbacks).await.unwrap();
        manager.dispatch("orders", "not json");

        match rx.recv().await.unwrap() {
            NotificationPayload::Raw(s) => assert_eq!(s, "not json"),
            NotificationPayload::Json(_) => panic!("expected a raw payload"),
        }
    }

    #[tokio::test]
    async fn listening_twice_on_the_same_channel_without_unlisten_fails() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let manager = NotificationManager::new(supervisor);

        manager.listen("orders", Callbacks::default()).await.unwrap();
        assert!(manager.listen("orders", Callbacks::default()).await.is_err());
    }

    #[tokio::test]
    async fn unlisten_then_listen_again_succeeds() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let manager = NotificationManager::new(supervisor);

        manager.listen("orders", Callbacks::default()).await.unwrap();
        manager.unlisten("orders").await.unwrap();
        manager.listen("orders", Callbacks::default()).await.unwrap();
    }

    #[tokio::test]
    async fn a_reconnect_re_issues_listen_and_fires_on_connect_again() {
        let driver = Arc::new(FakeDriver::always_succeeds(FakeConnection::healthy));
        let supervisor = SingleSupervisor::connect(Arc::clone(&driver)).await.unwrap();
        let manager = NotificationManager::new(supervisor);

        let connects = Arc::new(StdMutex::new(0usize));
        let (tx, mut fired_twice) = mpsc::unbounded_channel();
        let counted = Arc::clone(&connects);
        let callbacks = Callbacks {
            on_connect: Some(Box::new(move || {
                let mut n = counted.lock().unwrap();
                *n += 1;
                if *n == 2 {
                    let _ = tx.send(());
                }
            })),
            ..Default::default()
        };

        manager.listen("orders", callbacks).await.unwrap();
        assert_eq!(*connects.lock().unwrap(), 1);

        driver.inject(crate::driver::DriverSignal::End);
        tokio::time::timeout(Duration::from_secs(2), fired_twice.recv())
            .await
            .expect("reconnect should re-issue LISTEN before the timeout")
            .expect("channel should not close");
        assert_eq!(*connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_subsequent_listen_calls() {
        let driver = FakeDriver::always_succeeds(FakeConnection::healthy);
        let supervisor = SingleSupervisor::connect(driver).await.unwrap();
        let manager = NotificationManager::new(supervisor);

        manager.shutdown().await.unwrap();
        assert!(manager.listen("orders", Callbacks::default()).await.is_err());
    }
}
