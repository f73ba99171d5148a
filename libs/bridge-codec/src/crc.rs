//! CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF)

const CRC_POLY: u16 = 0xA001;
const CRC_INIT: u16 = 0xFFFF;

/// Compute the Modbus RTU checksum over `data`.
///
/// The result is transmitted low byte first (`to_le_bytes`).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Check the trailing two CRC bytes of a complete RTU frame.
///
/// Returns `(expected, received)` on mismatch.
pub fn verify(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((0, 0));
    }
    let split = frame.len() - 2;
    let expected = crc16(&frame[..split]);
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if expected == received {
        Ok(())
    } else {
        Err((expected, received))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_value() {
        // Read holding register 0, quantity 1, slave 1
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_crc16_empty_data() {
        assert_eq!(crc16(&[]), CRC_INIT);
    }

    #[test]
    fn test_crc16_wire_order() {
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(crc.to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn test_verify_frame() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        assert!(verify(&frame).is_ok());

        let mut broken = frame;
        broken[3] ^= 0x10;
        assert!(verify(&broken).is_err());
    }
}
