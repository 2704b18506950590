//! Notification error types

use thiserror::Error;

pub type NotificationResult<T> = Result<T, NotificationError>;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid notification: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Failure reported by the messaging provider for one send
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider refused the message with its own code
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn code(&self) -> &str {
        match self {
            ProviderError::Rejected { code, .. } => code,
            ProviderError::Transport(_) => "UNKNOWN_ERROR",
            ProviderError::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Rejected { message, .. } => message,
            ProviderError::Transport(message) | ProviderError::InvalidResponse(message) => message,
        }
    }
}
