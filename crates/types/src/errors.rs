//! Error types shared across the analytics crates

use thiserror::Error;

/// Result type alias for data model operations
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Main error type for the data model
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
