//! Storage Errors
//!
//! Error types for the transactional storage layer, classified as
//! transient (eligible for automatic retry) or persistent.

use std::fmt;
use std::time::Duration;

/// SQLSTATE codes PostgreSQL raises for conflicts that may succeed on retry
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement_timeout)
];

const UNIQUE_VIOLATION: &str = "23505";

/// Which bound of a transaction was exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting to acquire a connection / open the transaction
    Acquire,
    /// Running the transaction body
    Body,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Acquire => write!(f, "acquiring a transaction"),
            TimeoutPhase::Body => write!(f, "running the transaction body"),
        }
    }
}

/// Errors raised by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Lock/serialization conflicts and connection hiccups
    #[error("Transient storage error: {0}")]
    Transient(String),

    /// Anything that will fail again if retried unchanged
    #[error("Storage error: {0}")]
    Persistent(String),

    /// A transaction bound was exceeded
    #[error("Timed out after {elapsed:?} while {phase}")]
    Timeout {
        phase: TimeoutPhase,
        elapsed: Duration,
    },

    /// A unit of work was started while another one is open in the same task
    #[error("A unit of work is already open in this task; use execute_in to join it")]
    NestedScope,

    /// Stored state could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Check if this error is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Timeout { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Database(db_err) => db_err
                .code()
                .map(|code| TRANSIENT_SQLSTATES.contains(&&*code))
                .unwrap_or(false),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
            _ => false,
        };

        if transient {
            StorageError::Transient(err.to_string())
        } else {
            StorageError::Persistent(err.to_string())
        }
    }
}

/// Check if a sqlx error is a unique-key violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StorageError::Transient("deadlock".into()).is_transient());
        assert!(StorageError::Timeout {
            phase: TimeoutPhase::Acquire,
            elapsed: Duration::from_millis(10),
        }
        .is_transient());
        assert!(!StorageError::Persistent("syntax error".into()).is_transient());
        assert!(!StorageError::NestedScope.is_transient());
    }

    #[test]
    fn test_sqlx_pool_timeout_is_transient() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());

        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_message_names_phase() {
        let err = StorageError::Timeout {
            phase: TimeoutPhase::Body,
            elapsed: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("transaction body"));
    }
}
