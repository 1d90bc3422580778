//! Structured error handling for the task manager.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{entity} not found: {detail}")]
    NotFound { entity: &'static str, detail: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskerError {
    pub fn not_found(entity: &'static str, detail: impl Into<String>) -> Self {
        TaskerError::NotFound {
            entity,
            detail: detail.into(),
        }
    }

    /// Errors that should resolve into an `error`-type reply Message instead
    /// of bubbling up to the runtime.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            TaskerError::NotFound { .. } | TaskerError::Validation(_) | TaskerError::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
