//! Task execution error types
//!
//! Handlers return [`TaskError`] so the dispatcher can tell a failure the
//! broker should retry apart from one that must be dead-lettered immediately.

use std::fmt;

use crate::error::{AppError, ErrorMetadata};

/// Task execution error that can be either recoverable or unrecoverable
#[derive(Debug)]
pub enum TaskError {
    /// Retried by the broker while the retry budget lasts.
    Recoverable(anyhow::Error),
    /// Dead-lettered without further attempts.
    Unrecoverable(anyhow::Error),
}

impl TaskError {
    /// Invalid input, missing records and undecodable data: retrying will not help.
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Unrecoverable(err.into())
    }

    /// Filesystem hiccups, subprocess failures, store unavailability.
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Recoverable(err.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskError::Recoverable(_))
    }

    pub fn inner(&self) -> &anyhow::Error {
        match self {
            TaskError::Recoverable(err) | TaskError::Unrecoverable(err) => err,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // {:#} keeps the context chain on one line for log fields
        write!(f, "{:#}", self.inner())
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner().source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Default conversion from anyhow::Error creates a recoverable error
    fn from(err: anyhow::Error) -> Self {
        Self::recoverable(err)
    }
}

impl From<AppError> for TaskError {
    /// Classify by the error's own metadata.
    fn from(err: AppError) -> Self {
        if err.is_recoverable() {
            Self::recoverable(err)
        } else {
            Self::unrecoverable(err)
        }
    }
}
