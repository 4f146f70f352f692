use fileproc_core::AppError;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("file {0} not found")]
    NotFound(Uuid),

    #[error("gave up appending to file {file_id} after {attempts} conflicting attempts")]
    Conflict { file_id: Uuid, attempts: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize processed output: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored record is invalid: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Unavailable stores and exhausted conflicts are worth another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Database(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => AppError::NotFound(format!("file {}", id)),
            StoreError::Conflict { .. } => AppError::Conflict(err.to_string()),
            StoreError::Database(e) => AppError::from(e),
            StoreError::Serialization(e) => AppError::from(e),
            StoreError::Corrupt(msg) => AppError::InvalidInput(msg),
        }
    }
}
