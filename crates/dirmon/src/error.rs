//! Error types for the monitor

use std::io;
use thiserror::Error;

/// Monitor error type
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Storage error: {0}")]
    Storage(#[from] dirmon_db::BackendError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Failed to watch '{path}': {reason}")]
    WatchSubscription { path: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task error: {0}")]
    Limiter(#[from] crate::limiter::LimiterError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MonitorError {
    pub fn watch_subscription(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::WatchSubscription {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MonitorError>;
