//! Error types for issue-courier
//!
//! This module provides the error taxonomy shared by every pipeline stage:
//! - Transient failures (network, timeouts) that the retry policy re-enqueues
//! - Resource-not-found misses reported by collaborators, also retried up to the cap
//! - Validation failures on caller-supplied input, which fail fast
//! - Infrastructure errors (database, I/O, serialization)
//!
//! The task ledger renders any [`Error`] into a stored string through
//! [`Error::ledger_text`], so the raw error value never has to outlive the process.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for issue-courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for issue-courier
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient upstream failure reported by a collaborator (connection reset, busy, truncated body)
    #[error("transient failure: {0}")]
    Transient(String),

    /// An expected upstream resource was missing (detail element, download link)
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Caller-supplied input is invalid; retrying cannot change the outcome
    #[error("validation error: {0}")]
    Validation(String),

    /// The notifier reported that a message was not delivered
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// A job exceeded the configured wall-clock limit
    #[error("job timed out after {secs} seconds")]
    Timeout {
        /// The limit that was exceeded, in seconds
        secs: u64,
    },

    /// A downloaded file could not be found on disk
    #[error("file not found at {path}")]
    FileMissing {
        /// The path where the file was expected to be
        path: PathBuf,
    },

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Machine-readable error type, stable across releases
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(e) => match e {
                DatabaseError::ConnectionFailed(_) => "database_connection_failed",
                DatabaseError::MigrationFailed(_) => "database_migration_failed",
                DatabaseError::QueryFailed(_) => "database_error",
                DatabaseError::NotFound(_) => "record_not_found",
                DatabaseError::ConstraintViolation(_) => "constraint_violation",
            },
            Error::Sqlx(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Transient(_) => "transient",
            Error::ResourceNotFound(_) => "resource_not_found",
            Error::Validation(_) => "validation_error",
            Error::Delivery(_) => "delivery_failed",
            Error::Timeout { .. } => "timeout",
            Error::FileMissing { .. } => "file_missing",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }

    /// Render the error as the `{type, message}` string stored in the task ledger
    pub fn ledger_text(&self) -> String {
        format!("type: {}, message: {}", self.error_code(), self)
    }

    /// True for misses reported by a collaborator, which are logged apart from exceptions
    pub fn is_resource_miss(&self) -> bool {
        matches!(self, Error::ResourceNotFound(_))
    }
}
