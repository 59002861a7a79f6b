//! A resilient PostgreSQL access layer built on `tokio-postgres`: gated
//! connections that survive transient outages, retrying query/transaction
//! executors, and a durable `LISTEN`/`NOTIFY` client that resubscribes after
//! every reconnect.
//!
//! [`Client`] and [`Pool`] are the two entry points for queries and
//! transactions, single connection or pooled. [`NotificationClient`] is the
//! dedicated entry point for `LISTEN`/`NOTIFY` (behind the `notify` feature,
//! on by default). All three are thin aggregates over primitives defined in
//! `resilientpg-core`, which is re-exported as [`core`] for advanced callers
//! that need to plug in their own [`core::driver::Driver`].

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
#[cfg(feature = "notify")]
pub mod notify;
pub mod pool;

pub use resilientpg_core as core;

pub use client::Client;
pub use config::{ResilientPgConfig, TlsMode};
pub use core::config::{ConnectConfig, ExecutorConfig, PoolConfig};
pub use core::error::{Error, Result};
pub use core::supervisor::Metrics;
pub use pool::Pool;

#[cfg(feature = "notify")]
pub use notify::NotificationClient;
#[cfg(feature = "notify")]
pub use core::notify::{Callbacks, NotificationPayload};
