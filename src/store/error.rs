//! Store Error Types
//!
//! Every failure surfaced by the ledger store, the transaction executor and
//! the transfer orchestrator. Errors are classified into three kinds so that
//! callers can decide whether a retry makes sense.

use std::time::Duration;

use thiserror::Error;

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Constraint or lookup failure. Retrying the same request fails again.
    Validation,
    /// Concurrency conflict (lock timeout, serialization failure, deadlock).
    /// The caller may retry.
    Transient,
    /// Connection loss or unexpected database failure.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Infrastructure => "INFRASTRUCTURE",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    // === Validation Errors ===
    #[error("{table} row not found: id={id}")]
    NotFound { table: &'static str, id: i64 },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Unique violation: {0}")]
    UniqueViolation(String),

    #[error("Check constraint violation: {0}")]
    CheckViolation(String),

    #[error("Numeric value out of range")]
    NumericOutOfRange,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Transient Errors ===
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    // === Infrastructure Errors ===
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    // === Transaction boundary ===
    #[error("Commit failed: {0}")]
    Commit(Box<StoreError>),

    #[error("Transaction failed: {source}; rollback failed: {rollback}")]
    Rollback {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. }
            | StoreError::ForeignKeyViolation(_)
            | StoreError::UniqueViolation(_)
            | StoreError::CheckViolation(_)
            | StoreError::NumericOutOfRange
            | StoreError::InvalidArgument(_) => ErrorKind::Validation,
            StoreError::SerializationFailure(_)
            | StoreError::Deadlock(_)
            | StoreError::LockTimeout(_)
            | StoreError::DeadlineExceeded(_) => ErrorKind::Transient,
            StoreError::Connection(_) | StoreError::Database(_) => ErrorKind::Infrastructure,
            StoreError::Commit(inner) => inner.kind(),
            StoreError::Rollback { source, .. } => source.kind(),
        }
    }

    /// Whether a caller-side retry of the whole transfer may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable error code for logs and outer service layers
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::UniqueViolation(_) => "UNIQUE_VIOLATION",
            StoreError::CheckViolation(_) => "CHECK_VIOLATION",
            StoreError::NumericOutOfRange => "NUMERIC_OUT_OF_RANGE",
            StoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StoreError::SerializationFailure(_) => "SERIALIZATION_FAILURE",
            StoreError::Deadlock(_) => "DEADLOCK",
            StoreError::LockTimeout(_) => "LOCK_TIMEOUT",
            StoreError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            StoreError::Connection(_) => "CONNECTION_ERROR",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::Commit(_) => "COMMIT_FAILED",
            StoreError::Rollback { .. } => "ROLLBACK_FAILED",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                // SQLSTATE codes: https://www.postgresql.org/docs/current/errcodes-appendix.html
                match db.code().as_deref() {
                    Some("23503") => StoreError::ForeignKeyViolation(message),
                    Some("23505") => StoreError::UniqueViolation(message),
                    Some("23514") => StoreError::CheckViolation(message),
                    Some("22003") => StoreError::NumericOutOfRange,
                    Some("2201W") | Some("2201X") => StoreError::InvalidArgument(message),
                    Some("40001") => StoreError::SerializationFailure(message),
                    Some("40P01") => StoreError::Deadlock(message),
                    Some("55P03") => StoreError::LockTimeout(message),
                    _ => StoreError::Database(message),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}
