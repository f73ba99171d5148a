//! Modbus frame constants
//!
//! Sizes follow the Modbus application protocol: an RS485 ADU is at most 256
//! bytes, which leaves 253 bytes for the PDU once the slave address and CRC
//! are removed. The TCP side inherits the same PDU limit.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP bytes preceding the unit id: Transaction ID(2) + Protocol ID(2) + Length(2)
///
/// The Length field counts everything after itself, so a complete TCP frame is
/// `MBAP_HEADER_LEN + length` bytes.
pub const MBAP_HEADER_LEN: usize = 6;

/// Full MBAP header including the unit id
pub const MBAP_FULL_HEADER_LEN: usize = MBAP_HEADER_LEN + 1;

/// Maximum PDU (function code + data) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Minimum MBAP length field value (Unit ID + function code)
pub const MIN_MBAP_LENGTH: usize = 2;

/// Largest RTU application data unit
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Smallest RTU frame that can carry anything: slave + fc + CRC(2)
pub const MIN_RTU_FRAME_SIZE: usize = 4;

/// RTU exception frame: slave + fc|0x80 + code + CRC(2)
pub const RTU_EXCEPTION_FRAME_SIZE: usize = 5;

/// Modbus TCP protocol identifier
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Exception bit set on the function code of an error response
pub const EXCEPTION_BIT: u8 = 0x80;

/// Slave address reserved for broadcast
pub const BROADCAST_ADDRESS: u8 = 0;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;

/// Calculate total Modbus TCP frame size (MBAP header + unit id + PDU)
#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_FULL_HEADER_LEN + pdu_len
}

/// Calculate total RTU frame size (slave id + PDU + CRC)
#[inline]
pub const fn rtu_frame_size(pdu_len: usize) -> usize {
    1 + pdu_len + 2
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MBAP_FULL_HEADER_LEN, 7);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(rtu_frame_size(MAX_PDU_SIZE), MAX_RTU_FRAME_SIZE);
    }

    #[test]
    fn test_mbap_frame_size() {
        // 7-byte header + fc + addr(2) + qty(2)
        assert_eq!(mbap_frame_size(5), 12);
        assert_eq!(mbap_frame_size(MAX_PDU_SIZE), MBAP_HEADER_LEN + MAX_MBAP_LENGTH);
    }
}
