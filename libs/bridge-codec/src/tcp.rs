//! Modbus TCP framing: MBAP header + PDU
//!
//! `decode_tcp_frame` validates one complete frame; [`MbapCodec`] wraps the same
//! rules for a byte stream so a session can read requests with
//! `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::constants::{
    EXCEPTION_BIT, MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_FULL_HEADER_LEN, MBAP_HEADER_LEN,
    MIN_MBAP_LENGTH, MODBUS_PROTOCOL_ID,
};
use crate::error::{FrameError, Result};
use crate::exception::ExceptionCode;
use crate::pdu;
use crate::ResponsePayload;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    fn parse(data: &[u8]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::InvalidProtocolId(self.protocol_id));
        }
        let length = usize::from(self.length);
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(FrameError::LengthOutOfRange(self.length));
        }
        Ok(())
    }
}

/// A decoded Modbus TCP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRequest {
    pub header: MbapHeader,
    pub function_code: u8,
    /// PDU bytes after the function code
    pub body: Bytes,
}

impl TcpRequest {
    pub fn transaction_id(&self) -> u16 {
        self.header.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.header.unit_id
    }

    /// Starting register/coil address, for functions that carry one
    pub fn start_address(&self) -> Option<u16> {
        if pdu::has_start_address(self.function_code) && self.body.len() >= 2 {
            Some(u16::from_be_bytes([self.body[0], self.body[1]]))
        } else {
            None
        }
    }
}

/// A response to be written back to the TCP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpResponse {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Function code of the request (exception bit is added when encoding)
    pub function_code: u8,
    pub payload: ResponsePayload,
}

impl TcpResponse {
    pub fn exception(request: &TcpRequest, code: ExceptionCode) -> Self {
        Self {
            transaction_id: request.transaction_id(),
            unit_id: request.unit_id(),
            function_code: request.function_code,
            payload: ResponsePayload::Exception(code),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.payload {
            ResponsePayload::Data(data) => encode_tcp_response(
                self.transaction_id,
                self.unit_id,
                self.function_code,
                data,
            ),
            ResponsePayload::Exception(code) => encode_tcp_exception(
                self.transaction_id,
                self.unit_id,
                self.function_code,
                *code,
            ),
        }
    }
}

/// Decode exactly one complete Modbus TCP frame
pub fn decode_tcp_frame(data: &[u8]) -> Result<TcpRequest> {
    if data.len() < MBAP_FULL_HEADER_LEN + 1 {
        return Err(FrameError::TooShort {
            needed: MBAP_FULL_HEADER_LEN + 1,
            actual: data.len(),
        });
    }

    let header = MbapHeader::parse(data);
    header.validate()?;

    let declared = MBAP_HEADER_LEN + usize::from(header.length);
    if data.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let function_code = data[MBAP_FULL_HEADER_LEN];
    let body = &data[MBAP_FULL_HEADER_LEN + 1..];
    let needed = pdu::min_request_body(function_code, body);
    if body.len() < needed {
        return Err(FrameError::PduTooShort {
            function: function_code,
            needed,
            actual: body.len(),
        });
    }

    debug!(
        "MBAP: trans_id={:04X}, unit_id={}, FC={:02X}, body_len={}",
        header.transaction_id,
        header.unit_id,
        function_code,
        body.len()
    );

    Ok(TcpRequest {
        header,
        function_code,
        body: Bytes::copy_from_slice(body),
    })
}

fn write_mbap(buf: &mut impl BufMut, transaction_id: u16, unit_id: u8, pdu_len: usize) {
    buf.put_u16(transaction_id);
    buf.put_u16(MODBUS_PROTOCOL_ID);
    buf.put_u16((pdu_len + 1) as u16);
    buf.put_u8(unit_id);
}

/// Encode a client request frame (for tools talking to a gateway)
pub fn encode_tcp_request(
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    body: &[u8],
) -> Result<Vec<u8>> {
    let pdu_len = 1 + body.len();
    if pdu_len > MAX_PDU_SIZE {
        return Err(FrameError::PduTooLarge(pdu_len));
    }
    let mut frame = Vec::with_capacity(MBAP_FULL_HEADER_LEN + pdu_len);
    write_mbap(&mut frame, transaction_id, unit_id, pdu_len);
    frame.put_u8(function_code);
    frame.put_slice(body);
    Ok(frame)
}

/// Encode a normal response, echoing the request's transaction and unit id
pub fn encode_tcp_response(
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    payload: &[u8],
) -> Vec<u8> {
    let pdu_len = 1 + payload.len();
    let mut frame = Vec::with_capacity(MBAP_FULL_HEADER_LEN + pdu_len);
    write_mbap(&mut frame, transaction_id, unit_id, pdu_len);
    frame.put_u8(function_code);
    frame.put_slice(payload);
    frame
}

/// Encode an exception response (`function_code | 0x80`, code)
pub fn encode_tcp_exception(
    transaction_id: u16,
    unit_id: u8,
    function_code: u8,
    code: ExceptionCode,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_FULL_HEADER_LEN + 2);
    write_mbap(&mut frame, transaction_id, unit_id, 2);
    frame.put_u8(function_code | EXCEPTION_BIT);
    frame.put_u8(code.code());
    frame
}

/// Stream codec for the server side of a Modbus TCP connection
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = TcpRequest;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TcpRequest>> {
        if src.len() < MBAP_FULL_HEADER_LEN {
            return Ok(None);
        }

        // Reject garbage before buffering a body for it
        let header = MbapHeader::parse(&src[..MBAP_FULL_HEADER_LEN]);
        header.validate()?;

        let frame_len = MBAP_HEADER_LEN + usize::from(header.length);
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        decode_tcp_frame(&frame).map(Some)
    }
}

impl Encoder<TcpResponse> for MbapCodec {
    type Error = FrameError;

    fn encode(&mut self, item: TcpResponse, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

/// Client side helper: split one response frame into header and PDU.
///
/// Used by tools that talk to the gateway rather than by the gateway itself.
pub fn decode_tcp_response(data: &[u8]) -> Result<TcpResponse> {
    if data.len() < MBAP_FULL_HEADER_LEN + 2 {
        return Err(FrameError::TooShort {
            needed: MBAP_FULL_HEADER_LEN + 2,
            actual: data.len(),
        });
    }
    let header = MbapHeader::parse(data);
    header.validate()?;
    let declared = MBAP_HEADER_LEN + usize::from(header.length);
    if data.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let mut pdu = &data[MBAP_FULL_HEADER_LEN..];
    let raw_fc = pdu.get_u8();
    let payload = if raw_fc & EXCEPTION_BIT != 0 {
        ResponsePayload::Exception(ExceptionCode::from(pdu.get_u8()))
    } else {
        ResponsePayload::Data(Bytes::copy_from_slice(pdu))
    };

    Ok(TcpResponse {
        transaction_id: header.transaction_id,
        unit_id: header.unit_id,
        function_code: raw_fc & !EXCEPTION_BIT,
        payload,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // txn=1, proto=0, len=6, unit=10, fc=3, addr=41060 (0xA064), qty=2
    const READ_REQUEST: [u8; 12] = [
        0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x0A, 0x03, 0xA0, 0x64, 0x00, 0x02,
    ];

    // ========================================================================
    // decode_tcp_frame
    // ========================================================================

    #[test]
    fn test_decode_read_request() {
        let request = decode_tcp_frame(&READ_REQUEST).unwrap();

        assert_eq!(request.transaction_id(), 1);
        assert_eq!(request.unit_id(), 10);
        assert_eq!(request.header.length, 6);
        assert_eq!(request.function_code, 0x03);
        assert_eq!(&request.body[..], &[0xA0, 0x64, 0x00, 0x02]);
        assert_eq!(request.start_address(), Some(41060));
    }

    #[test]
    fn test_decode_invalid_protocol_id() {
        let mut frame = READ_REQUEST;
        frame[3] = 0x01;
        assert_eq!(
            decode_tcp_frame(&frame),
            Err(FrameError::InvalidProtocolId(1))
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut frame = READ_REQUEST;
        frame[5] = 0x07;
        assert!(matches!(
            decode_tcp_frame(&frame),
            Err(FrameError::LengthMismatch {
                declared: 13,
                actual: 12
            })
        ));
    }

    #[test]
    fn test_decode_short_pdu_for_function() {
        // FC3 with only an address, no quantity
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x0A, 0x03, 0xA0, 0x64];
        assert!(matches!(
            decode_tcp_frame(&frame),
            Err(FrameError::PduTooShort {
                function: 0x03,
                needed: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_decode_frame_too_short() {
        assert!(matches!(
            decode_tcp_frame(&READ_REQUEST[..7]),
            Err(FrameError::TooShort { .. })
        ));
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    #[test]
    fn test_encode_response_echoes_ids() {
        let frame = encode_tcp_response(0xBEEF, 10, 0x03, &[0x04, 0x00, 0x2A, 0x00, 0x07]);
        assert_eq!(
            frame,
            vec![0xBE, 0xEF, 0x00, 0x00, 0x00, 0x07, 0x0A, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x07]
        );
    }

    #[test]
    fn test_encode_exception() {
        let frame = encode_tcp_exception(
            1,
            10,
            0x03,
            ExceptionCode::GatewayTargetDeviceFailedToRespond,
        );
        assert_eq!(frame, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x0A, 0x83, 0x0B]);
    }

    #[test]
    fn test_encode_request_matches_wire_layout() {
        let frame = encode_tcp_request(1, 10, 0x03, &[0xA0, 0x64, 0x00, 0x02]).unwrap();
        assert_eq!(frame, READ_REQUEST.to_vec());
        assert!(matches!(
            encode_tcp_request(1, 10, 0x10, &[0u8; 253]),
            Err(FrameError::PduTooLarge(254))
        ));
    }

    #[test]
    fn test_request_survives_encode_decode() {
        let frame = encode_tcp_response(0x1234, 7, 0x10, &[0x00, 0x01, 0x00, 0x01, 0x02, 0xAB, 0xCD]);
        let request = decode_tcp_frame(&frame).unwrap();
        assert_eq!(request.transaction_id(), 0x1234);
        assert_eq!(&request.body[..], &[0x00, 0x01, 0x00, 0x01, 0x02, 0xAB, 0xCD]);
    }

    #[test]
    fn test_decode_tcp_response_exception() {
        let frame = encode_tcp_exception(9, 1, 0x04, ExceptionCode::ServerDeviceBusy);
        let response = decode_tcp_response(&frame).unwrap();
        assert_eq!(response.transaction_id, 9);
        assert_eq!(response.function_code, 0x04);
        assert_eq!(
            response.payload,
            ResponsePayload::Exception(ExceptionCode::ServerDeviceBusy)
        );
    }

    // ========================================================================
    // Stream codec
    // ========================================================================

    #[test]
    fn test_codec_waits_for_complete_frame() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::from(&READ_REQUEST[..9]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&READ_REQUEST[9..]);
        let request = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(request.transaction_id(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_splits_pipelined_frames() {
        let mut codec = MbapCodec;
        let mut second = READ_REQUEST;
        second[1] = 0x02;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&READ_REQUEST);
        buf.extend_from_slice(&second);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().transaction_id(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().transaction_id(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_bad_header_early() {
        let mut codec = MbapCodec;
        // length field of 0x1000 would otherwise make us buffer 4 KiB
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x10, 0x00, 0x01][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FrameError::LengthOutOfRange(0x1000))
        );
    }

    #[test]
    fn test_codec_encodes_response() {
        let mut codec = MbapCodec;
        let request = decode_tcp_frame(&READ_REQUEST).unwrap();
        let mut dst = BytesMut::new();
        codec
            .encode(
                TcpResponse::exception(&request, ExceptionCode::IllegalDataAddress),
                &mut dst,
            )
            .unwrap();
        assert_eq!(&dst[..], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x0A, 0x83, 0x02]);
    }
}
