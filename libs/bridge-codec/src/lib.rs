//! Modbus frame codec
//!
//! Byte-level encoding and decoding for both sides of the gateway:
//! - Modbus TCP: MBAP header + PDU, including a `tokio_util` stream codec
//! - Modbus RTU: slave id + PDU + CRC16
//!
//! Nothing in this crate performs I/O. Frames are validated here so that the
//! service layer only ever sees well-formed requests and checksummed responses.

pub mod constants;
pub mod crc;
pub mod error;
pub mod exception;
pub mod pdu;
pub mod rtu;
pub mod tcp;

pub use crc::crc16;
pub use error::{FrameError, Result};
pub use exception::ExceptionCode;
pub use pdu::{ModbusPdu, PduBuilder};
pub use rtu::{decode_rtu_response, encode_rtu_request, RtuRequest, RtuResponse};
pub use tcp::{
    decode_tcp_frame, decode_tcp_response, encode_tcp_exception, encode_tcp_request,
    encode_tcp_response, MbapCodec, MbapHeader, TcpRequest, TcpResponse,
};

/// Payload of a decoded response: either device data or a Modbus exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    /// PDU bytes following the function code
    Data(bytes::Bytes),
    /// Exception response (function code had the high bit set)
    Exception(ExceptionCode),
}

impl ResponsePayload {
    pub fn is_exception(&self) -> bool {
        matches!(self, ResponsePayload::Exception(_))
    }
}
