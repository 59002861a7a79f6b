//! Typed, single-subscriber-per-event lifecycle broadcaster.
//!
//! Subscribing to an event replaces whatever was subscribed before; at most
//! one subscriber exists per event name at any time; consumers that need to
//! fan out do so downstream of that single subscriber rather than inside the
//! bus. Emission never panics the emitter: a panicking subscriber is caught
//! and logged, never allowed to unwind into the Supervisor's state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use crate::error::Reason;

type Connect = Box<dyn Fn() + Send + Sync>;
type Disconnect = Box<dyn Fn(Option<Reason>) + Send + Sync>;
type Reconnect = Box<dyn Fn(Option<Reason>) + Send + Sync>;
type Notification = Box<dyn Fn(&str, &str) + Send + Sync>;

/// See module docs.
#[derive(Default)]
pub struct EventBus {
    connect: Mutex<Option<Connect>>,
    disconnect: Mutex<Option<Disconnect>>,
    reconnect: Mutex<Option<Reconnect>>,
    notification: Mutex<Option<Notification>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.connect.lock().unwrap() = Some(Box::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn(Option<Reason>) + Send + Sync + 'static) {
        *self.disconnect.lock().unwrap() = Some(Box::new(f));
    }

    pub fn on_reconnect(&self, f: impl Fn(Option<Reason>) + Send + Sync + 'static) {
        *self.reconnect.lock().unwrap() = Some(Box::new(f));
    }

    pub fn on_notification(&self, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.notification.lock().unwrap() = Some(Box::new(f));
    }

    pub fn emit_connect(&self) {
        invoke("connect", &self.connect, |f| f());
    }

    pub fn emit_disconnect(&self, reason: Option<Reason>) {
        invoke("disconnect", &self.disconnect, |f| f(reason));
    }

    pub fn emit_reconnect(&self, reason: Option<Reason>) {
        invoke("reconnect", &self.reconnect, |f| f(reason));
    }

    pub fn emit_notification(&self, channel: &str, payload: &str) {
        invoke("notification", &self.notification, |f| f(channel, payload));
    }
}

/// Takes the subscriber out from behind the lock, calls it *outside* the
/// lock (callbacks must never run while holding an internal lock that
/// `acquire`/`execute` might need), puts it back, and swallows any panic.
fn invoke<F, C: ?Sized>(event: &str, slot: &Mutex<Option<Box<C>>>, call: F)
where
    F: FnOnce(&C),
{
    let subscriber = slot.lock().unwrap().take();
    let Some(subscriber) = subscriber else {
        return;
    };

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(&*subscriber)));
    if let Err(panic) = result {
        tracing::error!(target: "resilientpg::events", %event, "subscriber for {event:?} panicked: {}", panic_message(&panic));
    }

    *slot.lock().unwrap() = Some(subscriber);
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribing_replaces_the_previous_subscriber() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f1 = first.clone();
        bus.on_connect(move || {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = second.clone();
        bus.on_connect(move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_connect();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitting_with_no_subscriber_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit_connect();
        bus.emit_disconnect(None);
    }

    #[test]
    fn a_panicking_subscriber_does_not_propagate_and_stays_subscribed() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        bus.on_connect(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });

        bus.emit_connect();
        bus.emit_connect();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
