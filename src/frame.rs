/// MBAP frame codec
///
/// Pure, synchronous encoding and decoding of Modbus TCP frames. A frame is a
/// 7-byte MBAP header followed by the PDU (function code and payload):
///
/// ```text
/// ┌────────────────┬──────────────┬──────────┬─────────┬──────────┬───────────┐
/// │ transaction id │ protocol id  │ length   │ unit id │ function │ payload   │
/// │ 2 bytes, BE    │ 2 bytes (=0) │ 2 bytes  │ 1 byte  │ 1 byte   │ length-2  │
/// └────────────────┴──────────────┴──────────┴─────────┴──────────┴───────────┘
/// ```

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusException, UnitId};
use crate::{MAX_PDU_SIZE, MBAP_HEADER_SIZE};

/// Modbus protocol identifier carried in every MBAP header
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Remaining byte count: unit id + PDU
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Parse the 7-byte header at the start of `buf`
    pub fn decode(buf: &[u8]) -> ModbusResult<Self> {
        if buf.len() < MBAP_HEADER_SIZE {
            return Err(ModbusError::frame_too_short(MBAP_HEADER_SIZE, buf.len()));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::invalid_protocol_id(header.protocol_id));
        }

        // unit id + function code at minimum, and the PDU must fit in 253 bytes
        if header.length < 2 || usize::from(header.length) > MAX_PDU_SIZE + 1 {
            return Err(ModbusError::frame(format!(
                "Invalid MBAP length: {}",
                header.length
            )));
        }

        Ok(header)
    }

    /// Total frame size this header announces
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_SIZE - 1 + usize::from(self.length)
    }
}

/// One request or response exchanged over a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: UnitId,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(transaction_id: u16, unit_id: UnitId, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            transaction_id,
            unit_id,
            function_code,
            payload,
        }
    }

    /// Decode the first complete frame in `buf`
    ///
    /// Returns the frame and the number of bytes it occupied, so several
    /// pipelined frames in one buffer can be consumed in turn. Fails with
    /// [`ModbusError::FrameTooShort`] while the frame is still incomplete.
    pub fn decode(buf: &[u8]) -> ModbusResult<(Self, usize)> {
        let header = MbapHeader::decode(buf)?;
        let frame_len = header.frame_len();
        if buf.len() < frame_len {
            return Err(ModbusError::frame_too_short(frame_len, buf.len()));
        }

        let pdu = &buf[MBAP_HEADER_SIZE..frame_len];
        let frame = Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            function_code: pdu[0],
            payload: pdu[1..].to_vec(),
        };

        Ok((frame, frame_len))
    }

    /// Encode into a byte sequence ready to be written to the connection
    pub fn encode(&self) -> ModbusResult<Vec<u8>> {
        encode_frame(self.transaction_id, self.unit_id, self.function_code, &self.payload)
    }
}

/// Encode an MBAP frame
///
/// The length field is 1 (unit id) + 1 (function code) + payload length.
pub fn encode_frame(
    transaction_id: u16,
    unit_id: UnitId,
    function_code: u8,
    payload: &[u8],
) -> ModbusResult<Vec<u8>> {
    if payload.len() + 1 > MAX_PDU_SIZE {
        return Err(ModbusError::frame(format!(
            "PDU too large: {} bytes",
            payload.len() + 1
        )));
    }

    let length = (payload.len() + 2) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + payload.len());

    // MBAP header
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);

    // PDU
    frame.push(function_code);
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// Encode an exception response for `function_code`
pub fn encode_exception(
    transaction_id: u16,
    unit_id: UnitId,
    function_code: u8,
    exception: ModbusException,
) -> Vec<u8> {
    let length = 3u16; // unit_id + function_code + exception_code
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 2);

    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.push(function_code | 0x80);
    frame.push(exception.to_u8());

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = Frame::new(0x1A2B, 7, 0x03, vec![0x00, 0x6B, 0x00, 0x03]);
        let bytes = request.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x1A, 0x2B, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );

        let (decoded, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_short_buffers_ask_for_more() {
        let bytes = encode_frame(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();

        assert!(matches!(
            Frame::decode(&bytes[..4]),
            Err(ModbusError::FrameTooShort { needed: 7, available: 4 })
        ));
        assert!(matches!(
            Frame::decode(&bytes[..9]),
            Err(ModbusError::FrameTooShort { needed: 12, available: 9 })
        ));
    }

    #[test]
    fn test_rejects_non_zero_protocol_id() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            Frame::decode(&bytes).unwrap_err(),
            ModbusError::InvalidProtocolId { protocol_id: 1 }
        );
    }

    #[test]
    fn test_rejects_bad_length() {
        // length 1: unit id only, no function code
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        assert!(matches!(Frame::decode(&bytes), Err(ModbusError::Frame { .. })));

        let bytes = [0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01];
        assert!(matches!(Frame::decode(&bytes), Err(ModbusError::Frame { .. })));
    }

    #[test]
    fn test_pipelined_frames() {
        let mut bytes = encode_frame(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
        bytes.extend(encode_frame(2, 1, 0x06, &[0x00, 0x00, 0x00, 0x2A]).unwrap());

        let (first, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(first.transaction_id, 1);
        let (second, rest) = Frame::decode(&bytes[consumed..]).unwrap();
        assert_eq!(second.transaction_id, 2);
        assert_eq!(second.function_code, 0x06);
        assert_eq!(consumed + rest, bytes.len());
    }

    #[test]
    fn test_exception_encoding() {
        let bytes = encode_exception(0x0102, 1, 0x01, ModbusException::IllegalDataAddress);
        assert_eq!(bytes, vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x02]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(encode_frame(1, 1, 0x03, &[0u8; 252]).is_ok());
        assert!(encode_frame(1, 1, 0x03, &[0u8; 253]).is_err());
    }
}
