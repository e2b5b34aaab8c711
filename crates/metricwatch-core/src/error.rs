//! Error types for Metricwatch

use thiserror::Error;

/// Result type alias using Metricwatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Metricwatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed criterion, filter or evaluation options
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store call failed in a way that may succeed on a later attempt
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Store rejected the query; retrying will not help until the rule changes
    #[error("Store rejected query: {0}")]
    PermanentStore(String),

    /// Evaluation was cancelled or ran past its deadline
    #[error("Evaluation cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient store error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientStore(msg.into())
    }

    /// Create a permanent store error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentStore(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Whether the scheduler may re-run the evaluation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }

    /// Whether the error came from cancellation rather than the rule or store
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::TransientStore(err.to_string()),
            sqlx::Error::Database(db) => {
                // SQLSTATE classes: 08 connection, 40 rollback, 53 resources, 57 operator intervention
                let transient = db
                    .code()
                    .map(|code| matches!(code.get(..2), Some("08" | "40" | "53" | "57")))
                    .unwrap_or(false);
                if transient {
                    Self::TransientStore(err.to_string())
                } else {
                    Self::PermanentStore(err.to_string())
                }
            }
            _ => Self::PermanentStore(err.to_string()),
        }
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
