//! Store Error Types

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by a billing store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Row addressed by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend unreachable or rejected the query
    #[error("Backend error: {0}")]
    Backend(String),

    /// Row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if the failed call may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
