//! Store Error Types

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors
///
/// A missing mapping is not an error: `resolve` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or the query failed
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Row exists but holds values outside the Modbus ranges
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Record addressed by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
