//! Error types for Rollwatch

use thiserror::Error;

/// Result type alias using Rollwatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Rollwatch operations
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store failure (timeout, unavailable, conflict)
    #[error("Storage error: {0}")]
    Storage(String),

    /// An alert config is missing fields required by its kind
    #[error("Alert config {config_id} is invalid: {message}")]
    Configuration {
        /// ID of the offending config
        config_id: String,
        /// What is wrong with it
        message: String,
    },

    /// Notification transport failure
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Application configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of thing looked up
        entity: String,
        /// Key that was not found
        id: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure to hand a message to the mail transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The relay could not be reached or answered with an error status
    #[error("HTTP error: {0}")]
    Http(String),

    /// The message was rejected before it was sent
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("Migration failed: {err}"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an alert configuration error
    pub fn configuration(config_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            config_id: config_id.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Delivery(_) | Self::Io(_))
    }
}
