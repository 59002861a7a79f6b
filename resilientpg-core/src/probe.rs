//! The connection probe: confirms a freshly (re)connected handle is actually
//! able to serve queries before the Supervisor opens its gate.

use std::time::Duration;

use crate::driver::RawConnection;
use crate::error::{Error, Result};

/// The literal statement run by every probe.
pub const PROBE_STATEMENT: &str = "SELECT 1";

/// Default timeout applied when a Supervisor doesn't override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs [`PROBE_STATEMENT`] against `connection`, racing it against
/// `timeout`. A timer win returns [`Error::ProbeTimeout`]; a driver win
/// requires at least one row back, or it's [`Error::ProbeFailed`].
///
/// The race is implemented with `tokio::select!`, which drops whichever
/// branch loses; the timer is cancelled on every exit path for free, and
/// there is no separate "cancel the timer" step to forget.
pub async fn probe<C: RawConnection>(connection: &C, timeout: Duration) -> Result<()> {
    tokio::select! {
        biased;

        result = connection.execute(PROBE_STATEMENT, &[]) => {
            let rows = result?;
            if rows.is_empty() {
                return Err(Error::ProbeFailed("probe returned no rows".into()));
            }
            Ok(())
        }
        _ = tokio::time::sleep(timeout) => Err(Error::ProbeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FakeConnection;

    #[tokio::test]
    async fn a_healthy_connection_passes() {
        let conn = FakeConnection::healthy();
        probe(&conn, Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn a_connection_returning_no_rows_fails_with_probe_failed() {
        let conn = FakeConnection::empty_rows();
        let err = probe(&conn, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::ProbeFailed(_)));
    }

    #[tokio::test]
    async fn a_hanging_connection_times_out() {
        let conn = FakeConnection::hangs();
        let err = probe(&conn, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::ProbeTimeout));
    }

    #[tokio::test]
    async fn a_driver_error_is_propagated_as_is() {
        let conn = FakeConnection::errors();
        let err = probe(&conn, Duration::from_millis(200)).await.unwrap_err();
        assert!(!matches!(err, Error::ProbeTimeout | Error::ProbeFailed(_)));
    }
}
