//! Classification of `sqlx` errors into [`AppError`] kinds.

use seatbook_core::error::{AppError, ErrorKind};

/// SQLSTATE `serialization_failure`.
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE `deadlock_detected`.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
/// SQLSTATE `query_canceled`, raised when `statement_timeout` expires.
pub const QUERY_CANCELED: &str = "57014";

/// Error kind for a PostgreSQL SQLSTATE code.
pub fn kind_for_sqlstate(code: &str) -> ErrorKind {
    match code {
        SERIALIZATION_FAILURE | DEADLOCK_DETECTED => ErrorKind::Deadlock,
        UNIQUE_VIOLATION => ErrorKind::Conflict,
        LOCK_NOT_AVAILABLE | QUERY_CANCELED => ErrorKind::Timeout,
        _ => ErrorKind::Database,
    }
}

/// Map a `sqlx` error to the error kind the engine acts on.
pub fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map_or(ErrorKind::Database, |code| kind_for_sqlstate(&code)),
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Connection,
        sqlx::Error::Configuration(_) => ErrorKind::Configuration,
        _ => ErrorKind::Database,
    }
}

/// Wrap a `sqlx` error with context, keeping it as the source.
pub fn store_error(context: &str, err: sqlx::Error) -> AppError {
    let kind = classify(&err);
    AppError::with_source(kind, format!("{context}: {err}"), err)
}
