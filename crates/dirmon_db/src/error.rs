//! Error types for the storage layer.

use thiserror::Error;

/// Storage operation result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors from storage backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// SQLx error (connection, query, etc.)
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (creating the database directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Statement could not be prepared for execution
    #[error("Query error: {0}")]
    Query(String),

    /// A `$name` placeholder had no bound value
    #[error("Missing value for parameter ${0}")]
    MissingParameter(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),
}

impl BackendError {
    /// Create a query error.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a type conversion error.
    pub fn type_conversion(msg: impl Into<String>) -> Self {
        Self::TypeConversion(msg.into())
    }
}
