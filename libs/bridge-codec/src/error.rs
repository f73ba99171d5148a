//! Frame codec errors

use thiserror::Error;

/// Result alias for codec operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors raised while encoding or decoding a Modbus frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {actual} bytes (need {needed})")]
    TooShort { needed: usize, actual: usize },

    #[error("Invalid protocol ID: expected 0, got {0}")]
    InvalidProtocolId(u16),

    #[error("MBAP length out of range: {0}")]
    LengthOutOfRange(u16),

    #[error("Invalid TCP frame length: header declares {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Payload too short for FC {function:02X}: {actual} bytes (need {needed})")]
    PduTooShort {
        function: u8,
        needed: usize,
        actual: usize,
    },

    #[error("PDU too large: {0} bytes (max 253)")]
    PduTooLarge(usize),

    #[error("CRC mismatch: expected {expected:04X}, received {received:04X}")]
    Checksum { expected: u16, received: u16 },

    #[error("I/O error: {0}")]
    Io(String),
}

impl FrameError {
    /// True for a CRC failure on an otherwise complete RTU frame
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::Checksum { .. })
    }
}

// Required by tokio_util::codec::Decoder
impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}
