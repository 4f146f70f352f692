//! Error types module
//!
//! `AppError` unifies the failures of the record store. Each variant
//! self-describes through [`ErrorMetadata`] so callers can decide how loudly to
//! log it and whether a retry is worthwhile.
//!
//! The `Database` variant wraps `sqlx::Error` only when the `sqlx` feature is on.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like write conflicts
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Self-description of an error for logging and retry decisions
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "DATABASE_ERROR")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::RowNotFound => AppError::NotFound("row not found".to_string()),
            other => AppError::Database(other),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

/// Static metadata for each variant: (error_code, recoverable, log_level).
fn app_error_static_metadata(err: &AppError) -> (&'static str, bool, LogLevel) {
    match err {
        AppError::Database(_) => ("DATABASE_ERROR", true, LogLevel::Error),
        AppError::NotFound(_) => ("NOT_FOUND", false, LogLevel::Debug),
        AppError::Conflict(_) => ("CONFLICT", true, LogLevel::Warn),
        AppError::InvalidInput(_) => ("INVALID_INPUT", false, LogLevel::Debug),
    }
}

impl ErrorMetadata for AppError {
    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).2
    }
}
