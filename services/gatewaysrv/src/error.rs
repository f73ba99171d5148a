//! Gateway error types

use std::time::Duration;

use bridge_codec::FrameError;
use bridge_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Outcome of a failed bus dispatch. Exactly one per request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// No complete response within the response window
    #[error("No response from slave within {0:?}")]
    Timeout(Duration),

    #[error("Response CRC mismatch: expected {expected:04X}, received {received:04X}")]
    Checksum { expected: u16, received: u16 },

    /// Response arrived but could not be used (too short, wrong slave or function)
    #[error("Invalid RTU response: {0}")]
    Frame(String),

    /// Request waited longer than the admission timeout, or the queue is full
    #[error("Serial bus busy")]
    Busy,

    /// Serial port is not open or failed mid-transaction
    #[error("Serial bus unavailable: {0}")]
    Unavailable(String),

    /// Arbiter worker has stopped
    #[error("Serial bus arbiter closed")]
    Closed,
}

impl BusError {
    /// Failures worth one more attempt on the line
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::Timeout(_) | BusError::Checksum { .. } | BusError::Frame(_)
        )
    }
}

impl From<FrameError> for BusError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Checksum { expected, received } => {
                BusError::Checksum { expected, received }
            },
            other => BusError::Frame(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}
