//! Modbus PDU buffer
//!
//! Fixed-size stack array so a request can be rebuilt for the serial side
//! without a heap allocation per frame.

use tracing::debug;

use crate::constants::{self, MAX_PDU_SIZE};
use crate::error::{FrameError, Result};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice (function code first)
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(data.len()));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(self.len + 1));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi)?;
        self.push(lo)
    }

    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(self.len + data.len()));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Data following the function code
    #[inline]
    pub fn body(&self) -> &[u8] {
        if self.len > 1 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & constants::EXCEPTION_BIT != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Result<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), len={}",
                fc,
                function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }
}

/// Human-readable function code name (exception bit ignored)
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & 0x7F {
        constants::FC_READ_COILS => "Read Coils",
        constants::FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        constants::FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        constants::FC_READ_INPUT_REGISTERS => "Read Input Registers",
        constants::FC_WRITE_SINGLE_COIL => "Write Single Coil",
        constants::FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        constants::FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        constants::FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        constants::FC_READ_WRITE_MULTIPLE_REGISTERS => "Read/Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Function codes whose request body starts with a 16-bit register/coil address.
///
/// These are the only functions the gateway can remap onto the serial side.
pub fn has_start_address(fc: u8) -> bool {
    matches!(
        fc,
        constants::FC_READ_COILS
            | constants::FC_READ_DISCRETE_INPUTS
            | constants::FC_READ_HOLDING_REGISTERS
            | constants::FC_READ_INPUT_REGISTERS
            | constants::FC_WRITE_SINGLE_COIL
            | constants::FC_WRITE_SINGLE_REGISTER
            | constants::FC_WRITE_MULTIPLE_COILS
            | constants::FC_WRITE_MULTIPLE_REGISTERS
            | constants::FC_READ_WRITE_MULTIPLE_REGISTERS
    )
}

/// Read functions must never be sent to the broadcast address.
pub fn is_read_function(fc: u8) -> bool {
    matches!(
        fc,
        constants::FC_READ_COILS
            | constants::FC_READ_DISCRETE_INPUTS
            | constants::FC_READ_HOLDING_REGISTERS
            | constants::FC_READ_INPUT_REGISTERS
            | constants::FC_READ_WRITE_MULTIPLE_REGISTERS
    )
}

/// Minimum request body length (bytes after the function code).
///
/// Multi-write functions include their byte count, so the minimum grows with
/// the declared count once it is readable. Unknown functions have no minimum.
pub fn min_request_body(fc: u8, body: &[u8]) -> usize {
    match fc {
        constants::FC_READ_COILS
        | constants::FC_READ_DISCRETE_INPUTS
        | constants::FC_READ_HOLDING_REGISTERS
        | constants::FC_READ_INPUT_REGISTERS
        | constants::FC_WRITE_SINGLE_COIL
        | constants::FC_WRITE_SINGLE_REGISTER => 4,
        // addr(2) + qty(2) + byte count(1) + values
        constants::FC_WRITE_MULTIPLE_COILS | constants::FC_WRITE_MULTIPLE_REGISTERS => {
            5 + body.get(4).copied().map(usize::from).unwrap_or(0)
        },
        // read addr(2) + read qty(2) + write addr(2) + write qty(2) + byte count(1) + values
        constants::FC_READ_WRITE_MULTIPLE_REGISTERS => {
            9 + body.get(8).copied().map(usize::from).unwrap_or(0)
        },
        _ => 0,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());

        pdu.push(0x03).unwrap();
        pdu.push_u16(0xA064).unwrap();
        pdu.push_u16(0x0002).unwrap();

        assert_eq!(pdu.function_code(), Some(0x03));
        assert!(!pdu.is_exception());
        assert_eq!(pdu.as_slice(), &[0x03, 0xA0, 0x64, 0x00, 0x02]);
        assert_eq!(pdu.body(), &[0xA0, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn test_pdu_builder() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .address(0x0100)
            .unwrap()
            .quantity(0x000A)
            .unwrap()
            .build();

        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&vec![0xFF; MAX_PDU_SIZE + 1]).is_err());

        pdu.extend(&vec![0x01; MAX_PDU_SIZE]).unwrap();
        assert_eq!(pdu.push(0x00), Err(FrameError::PduTooLarge(MAX_PDU_SIZE + 1)));
    }

    #[test]
    fn test_from_slice_too_large() {
        let err = ModbusPdu::from_slice(&vec![0xFF; MAX_PDU_SIZE + 1]).unwrap_err();
        assert!(err.to_string().contains("PDU too large"));
    }

    #[test]
    fn test_min_request_body() {
        assert_eq!(min_request_body(0x03, &[]), 4);
        assert_eq!(min_request_body(0x06, &[0, 1, 0, 5]), 4);
        // Write 2 registers: byte count 4
        assert_eq!(min_request_body(0x10, &[0, 0, 0, 2, 4]), 9);
        assert_eq!(min_request_body(0x10, &[0, 0]), 5);
        assert_eq!(min_request_body(0x17, &[0, 0, 0, 1, 0, 0, 0, 1, 2]), 11);
        assert_eq!(min_request_body(0x2B, &[]), 0);
    }

    #[test]
    fn test_function_classes() {
        assert!(has_start_address(0x10));
        assert!(!has_start_address(0x08));
        assert!(is_read_function(0x04));
        assert!(!is_read_function(0x06));
        assert_eq!(function_code_description(0x83), "Read Holding Registers");
    }
}
