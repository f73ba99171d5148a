//! Modbus RTU framing: slave id + PDU + CRC16 (little-endian)

use bytes::Bytes;
use tracing::debug;

use crate::constants::{
    self, BROADCAST_ADDRESS, EXCEPTION_BIT, MIN_RTU_FRAME_SIZE, RTU_EXCEPTION_FRAME_SIZE,
};
use crate::crc;
use crate::error::{FrameError, Result};
use crate::exception::ExceptionCode;
use crate::pdu::ModbusPdu;
use crate::ResponsePayload;

/// One request destined for the serial line
#[derive(Debug, Clone)]
pub struct RtuRequest {
    pub slave_id: u8,
    pub pdu: ModbusPdu,
}

impl RtuRequest {
    pub fn new(slave_id: u8, pdu: ModbusPdu) -> Self {
        Self { slave_id, pdu }
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.function_code().unwrap_or(0)
    }

    pub fn is_broadcast(&self) -> bool {
        self.slave_id == BROADCAST_ADDRESS
    }

    /// Wire bytes with the CRC appended
    pub fn to_frame(&self) -> Vec<u8> {
        build_frame(self.slave_id, self.pdu.as_slice())
    }
}

/// Decoded response from a slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub slave_id: u8,
    /// Function code with the exception bit cleared
    pub function_code: u8,
    pub payload: ResponsePayload,
}

fn build_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(constants::rtu_frame_size(pdu.len()));
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc::crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encode an RTU request frame from its parts
pub fn encode_rtu_request(slave_id: u8, function_code: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let mut pdu = ModbusPdu::new();
    pdu.push(function_code)?;
    pdu.extend(payload)?;
    Ok(build_frame(slave_id, pdu.as_slice()))
}

/// Decode a complete RTU response frame.
///
/// The CRC is checked before anything else is interpreted, so a corrupted
/// frame can never produce a payload.
pub fn decode_rtu_response(frame: &[u8]) -> Result<RtuResponse> {
    if frame.len() < MIN_RTU_FRAME_SIZE {
        return Err(FrameError::TooShort {
            needed: MIN_RTU_FRAME_SIZE,
            actual: frame.len(),
        });
    }

    crc::verify(frame)
        .map_err(|(expected, received)| FrameError::Checksum { expected, received })?;

    let slave_id = frame[0];
    let raw_fc = frame[1];
    let body = &frame[2..frame.len() - 2];

    if raw_fc & EXCEPTION_BIT != 0 {
        if frame.len() != RTU_EXCEPTION_FRAME_SIZE {
            return Err(FrameError::TooShort {
                needed: RTU_EXCEPTION_FRAME_SIZE,
                actual: frame.len(),
            });
        }
        let code = ExceptionCode::from(body[0]);
        debug!(
            "RTU exception: slave={}, FC={:02X}, code={}",
            slave_id,
            raw_fc & !EXCEPTION_BIT,
            code
        );
        return Ok(RtuResponse {
            slave_id,
            function_code: raw_fc & !EXCEPTION_BIT,
            payload: ResponsePayload::Exception(code),
        });
    }

    // A stray trailing 0x00 still satisfies CRC-16/MODBUS, so the layout is checked too
    if let Some(declared) = expected_response_len(raw_fc, frame) {
        if frame.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }
    }

    Ok(RtuResponse {
        slave_id,
        function_code: raw_fc,
        payload: ResponsePayload::Data(Bytes::copy_from_slice(body)),
    })
}

/// Expected length of a response to `request_fc`, given the bytes received so far.
///
/// Returns `None` while the length cannot yet be determined or for functions
/// with no fixed response layout; the caller then falls back to the silence
/// interval to find the end of the frame.
pub fn expected_response_len(request_fc: u8, received: &[u8]) -> Option<usize> {
    let fc = *received.get(1)?;
    if fc & EXCEPTION_BIT != 0 {
        return Some(RTU_EXCEPTION_FRAME_SIZE);
    }
    if fc != request_fc {
        return None;
    }
    match fc {
        constants::FC_READ_COILS
        | constants::FC_READ_DISCRETE_INPUTS
        | constants::FC_READ_HOLDING_REGISTERS
        | constants::FC_READ_INPUT_REGISTERS
        | constants::FC_READ_WRITE_MULTIPLE_REGISTERS => {
            let byte_count = *received.get(2)?;
            // slave + fc + count + data + crc
            Some(3 + usize::from(byte_count) + 2)
        },
        // Echo of address + value/quantity
        constants::FC_WRITE_SINGLE_COIL
        | constants::FC_WRITE_SINGLE_REGISTER
        | constants::FC_WRITE_MULTIPLE_COILS
        | constants::FC_WRITE_MULTIPLE_REGISTERS => Some(8),
        _ => None,
    }
}
