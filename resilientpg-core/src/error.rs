//! Error and Result types.

use std::sync::Arc;

/// A specialized `Result` type for resilientpg.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy described by the connection-lifecycle core.
///
/// Every variant corresponds to one of the error kinds the core is required
/// to surface; transient driver errors are not a variant of their own here
/// because they never reach the caller as a distinct kind: the executors
/// recover them internally and only the final, non-retriable failure (a
/// [`Error::Driver`] or [`Error::Io`]) is ever returned.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration, raised synchronously at construction.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The request arrived after shutdown had already begun.
    #[error("request rejected: shut down")]
    Shutdown,

    /// Shutdown was requested but in-flight requests had not drained by the
    /// deadline passed to `shutdown(timeout)`.
    #[error("shutdown timed out: {0}")]
    ShutdownTimeout(String),

    /// An error returned by the driver that was not retried (non-retriable,
    /// or the retry budget was exhausted).
    #[error("driver error: {0}")]
    Driver(#[source] Arc<tokio_postgres::Error>),

    /// I/O failure talking to the server (connection reset, refused, etc.).
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// [`ConnectionProbe`][crate::probe::ConnectionProbe] did not get a
    /// response within its timeout. Treated as a connection failure by the
    /// Supervisor, never surfaced past it except when it causes the
    /// *initial* connect to fail.
    #[error("connection probe timed out")]
    ProbeTimeout,

    /// A probe ran successfully but returned no rows, or a row with an
    /// unexpected shape.
    #[error("connection probe failed: {0}")]
    ProbeFailed(String),

    /// Several subordinate shutdowns each failed; this wraps all of them.
    #[error("{} subordinate shutdown(s) failed: {}", .0.len(), join_display(.0))]
    Aggregate(Vec<Error>),
}

fn join_display(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Driver(Arc::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// True for error kinds an executor should retry locally rather than
    /// ever surface to a caller on a non-final attempt.
    pub fn is_retriable(&self) -> bool {
        crate::retriable::is_retriable(self)
    }

    pub(crate) fn shared(self) -> Arc<Error> {
        Arc::new(self)
    }
}

/// A reason carried by a [`Gate`][crate::gate::Gate] close, shared between
/// every waiter that observes it.
pub type Reason = Arc<Error>;
