//! Connection-lifecycle and request-orchestration core for a resilient
//! PostgreSQL access layer: a readiness gate, retriable-error
//! classification, jittered backoff, a connection probe, a lifecycle event
//! bus, single-connection and pooled supervisors, retrying query/transaction
//! executors, and (optionally) `LISTEN`/`NOTIFY` subscription management.
//!
//! Not intended to be used directly; see the `resilientpg` facade crate.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
#[cfg(feature = "notify")]
pub mod notify;
pub mod probe;
pub mod retriable;
pub mod supervisor;

pub use error::{Error, Result};
