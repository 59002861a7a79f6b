//! Pure classification of driver errors as transient (worth retrying) or
//! fatal, over a closed set of SQLSTATE classes and OS/network error codes.

use std::io;

use crate::error::Error;

/// PostgreSQL SQLSTATE classes 08, 25, 40, 53, 55, 57, plus the OS/network
/// error codes that indicate a dropped or unreachable connection. Anything
/// not in this set is treated as fatal, surfaced immediately, never retried.
const TRANSIENT_SQLSTATES: &[&str] = &[
    // Class 08, Connection Exception
    "08000", "08001", "08003", "08004", "08006", "08007", "08P01",
    // Class 25, Invalid Transaction State
    "25000", "25001", "25P01", "25P02",
    // Class 40, Transaction Rollback
    "40000", "40001", "40002", "40003", "40P01",
    // Class 53, Insufficient Resources
    "53000", "53100", "53200", "53300", "53400",
    // Class 55, Object Not In Prerequisite State
    "55P03",
    // Class 57, Operator Intervention
    "57000", "57014", "57P01", "57P02", "57P03", "57P04", "57P05",
];

/// `true` iff `code` (case-insensitive) names a transient SQLSTATE or a
/// transient OS/network error.
pub fn is_transient_code(code: &str) -> bool {
    let upper = code.to_ascii_uppercase();
    TRANSIENT_SQLSTATES.contains(&upper.as_str()) || is_transient_errno_name(&upper)
}

fn is_transient_errno_name(upper: &str) -> bool {
    matches!(
        upper,
        "ECONNRESET"
            | "ECONNREFUSED"
            | "ECONNABORTED"
            | "ETIMEDOUT"
            | "EPIPE"
            | "EHOSTUNREACH"
            | "ENETUNREACH"
            | "EAI_AGAIN"
    )
}

/// `true` iff `kind` is one of the stable [`io::ErrorKind`]s that correspond
/// to a transient OS/network error code.
fn is_transient_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
    )
}

/// The error-classification predicate used by every retry loop.
///
/// Never panics. Pure function of the error's code: two calls with
/// equivalent errors always agree.
pub fn is_retriable(err: &Error) -> bool {
    match err {
        Error::Driver(db_err) => {
            if let Some(code) = db_err.code() {
                return is_transient_code(code.code());
            }
            io_source(db_err).is_some_and(|io_err| is_transient_io_kind(io_err.kind()))
        }
        Error::Io(io_err) => is_transient_io_kind(io_err.kind()),
        Error::Validation(_)
        | Error::Shutdown
        | Error::ShutdownTimeout(_)
        | Error::ProbeTimeout
        | Error::ProbeFailed(_)
        | Error::Aggregate(_) => false,
    }
}

fn io_source(err: &tokio_postgres::Error) -> Option<&io::Error> {
    use std::error::Error as _;
    let mut source = err.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_case_insensitive() {
        assert!(is_transient_code("40001"));
        assert!(is_transient_code("econnreset"));
        assert!(is_transient_code("ECONNRESET"));
    }

    #[test]
    fn unique_violation_is_not_transient() {
        assert!(!is_transient_code("23505"));
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let err = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset).into());
        assert!(is_retriable(&err));

        let err = Error::Io(io::Error::from(io::ErrorKind::InvalidInput).into());
        assert!(!is_retriable(&err));
    }

    #[test]
    fn non_driver_errors_are_never_retriable() {
        assert!(!is_retriable(&Error::Shutdown));
        assert!(!is_retriable(&Error::Validation("missing host".into())));
        assert!(!is_retriable(&Error::ProbeTimeout));
    }
}
