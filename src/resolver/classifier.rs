use crate::ResolverError;

/// Messages that mark a failure as a broken or unreachable connection.
const CONNECTION_MESSAGES: &[&str] = &[
    "connection reset by peer",
    "connection refused",
    "timed out",
    "timeout",
    "starting up",
];

/// SQLSTATE codes for connection exceptions, server shutdown and resource exhaustion.
pub const CONNECTION_SQLSTATES: &[&str] = &[
    "08000", "08003", "08006", "08001", "08004", "08007", "08P01", "57P01", "57P02", "57P03",
    "53000", "53100", "53200", "53300", "53400",
];

/// Decides whether a failed read should be retried on the primary.
pub trait ErrorClassifier: Send + Sync {
    fn is_connection_error(&self, err: &ResolverError) -> bool;
}

/// Classifies by SQLSTATE first, then by well-known transport messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn is_connection_error(&self, err: &ResolverError) -> bool {
        if matches!(
            err,
            ResolverError::Canceled | ResolverError::DeadlineExceeded | ResolverError::NoRows
        ) {
            return false;
        }

        if err
            .sqlstate()
            .is_some_and(|code| CONNECTION_SQLSTATES.contains(&code))
        {
            return true;
        }

        let message = err.to_string();
        // "EOF" is matched as written; lowercase "eof" shows up in unrelated syntax errors.
        if message.contains("EOF") {
            return true;
        }
        let message = message.to_lowercase();
        CONNECTION_MESSAGES.iter().any(|needle| message.contains(needle))
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ResolverError) -> bool + Send + Sync,
{
    fn is_connection_error(&self, err: &ResolverError) -> bool {
        self(err)
    }
}
