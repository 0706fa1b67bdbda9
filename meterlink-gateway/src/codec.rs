//! Modbus RTU frame codec for the "read holding registers" exchange.
//!
//! Request:  `[address, 0x03, startHi, startLo, countHi, countLo, crcLo, crcHi]`
//! Response: `[address, 0x03, byteCount, payload..., crcLo, crcHi]`

use thiserror::Error;

/// Function code for "read holding registers".
pub const FUNCTION_READ_HOLDING: u8 = 0x03;

/// Length of every request frame.
pub const REQUEST_LEN: usize = 8;

/// Address, function code and byte count.
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Trailing checksum.
pub const CRC_LEN: usize = 2;

/// Shortest frame: a header and a checksum around an empty payload.
pub const MIN_FRAME_LEN: usize = RESPONSE_HEADER_LEN + CRC_LEN;

/// Reasons a received frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Incomplete frame: {received} bytes, need at least {required}")]
    Incomplete { received: usize, required: usize },

    #[error("CRC mismatch (received 0x{received:04X}, computed 0x{computed:04X})")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Header mismatch (address {address}, function 0x{function:02X})")]
    HeaderMismatch { address: u8, function: u8 },

    #[error("Frame exceeds the {capacity}-byte receive buffer")]
    Oversized { capacity: usize },
}

/// Modbus CRC16 (initial 0xFFFF, reflected polynomial 0xA001).
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// A "read holding registers" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    bytes: [u8; REQUEST_LEN],
}

impl RequestFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn address(&self) -> u8 {
        self.bytes[0]
    }

    pub fn function(&self) -> u8 {
        self.bytes[1]
    }

    pub fn register_start(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn register_count(&self) -> u16 {
        u16::from_be_bytes([self.bytes[4], self.bytes[5]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_le_bytes([self.bytes[6], self.bytes[7]])
    }
}

/// Build a request for `register_count` holding registers starting at `register_start`.
pub fn build_request(address: u8, register_start: u16, register_count: u16) -> RequestFrame {
    let mut bytes = [0u8; REQUEST_LEN];
    bytes[0] = address;
    bytes[1] = FUNCTION_READ_HOLDING;
    bytes[2..4].copy_from_slice(&register_start.to_be_bytes());
    bytes[4..6].copy_from_slice(&register_count.to_be_bytes());

    let crc = crc16(&bytes[..6]);
    bytes[6..].copy_from_slice(&crc.to_le_bytes());

    RequestFrame { bytes }
}

/// Parse a request frame received on the slave side.
pub fn parse_request(bytes: &[u8]) -> Result<RequestFrame, FrameError> {
    if bytes.len() < REQUEST_LEN {
        return Err(FrameError::Incomplete {
            received: bytes.len(),
            required: REQUEST_LEN,
        });
    }

    let bytes = &bytes[..REQUEST_LEN];
    check_crc(bytes)?;

    if bytes[1] != FUNCTION_READ_HOLDING {
        return Err(FrameError::HeaderMismatch {
            address: bytes[0],
            function: bytes[1],
        });
    }

    let mut frame = [0u8; REQUEST_LEN];
    frame.copy_from_slice(bytes);
    Ok(RequestFrame { bytes: frame })
}

/// Parsed view of a validated response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame<'a> {
    pub address: u8,
    pub function: u8,
    /// Byte count as announced by the slave.
    pub byte_count: u8,
    pub payload: &'a [u8],
    pub checksum: u16,
}

/// Validate a response and return the full frame view.
///
/// `min_len` is the shortest frame the caller can use; anything shorter is
/// [`FrameError::Incomplete`] before the checksum is looked at. It never
/// drops below [`MIN_FRAME_LEN`].
///
/// Checks run in a fixed order: length, checksum, then header.
pub fn parse_response(
    bytes: &[u8],
    expected_address: u8,
    min_len: usize,
) -> Result<ResponseFrame<'_>, FrameError> {
    let required = min_len.max(MIN_FRAME_LEN);
    if bytes.len() < required {
        return Err(FrameError::Incomplete {
            received: bytes.len(),
            required,
        });
    }

    let checksum = check_crc(bytes)?;

    if bytes[0] != expected_address || bytes[1] != FUNCTION_READ_HOLDING {
        return Err(FrameError::HeaderMismatch {
            address: bytes[0],
            function: bytes[1],
        });
    }

    Ok(ResponseFrame {
        address: bytes[0],
        function: bytes[1],
        byte_count: bytes[2],
        payload: &bytes[RESPONSE_HEADER_LEN..bytes.len() - CRC_LEN],
        checksum,
    })
}

/// Validate a response and return its payload.
pub fn validate_response(
    bytes: &[u8],
    expected_address: u8,
    min_len: usize,
) -> Result<&[u8], FrameError> {
    parse_response(bytes, expected_address, min_len).map(|frame| frame.payload)
}

/// Build a response frame carrying `payload`.
pub fn encode_response(address: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_HEADER_LEN + payload.len() + CRC_LEN);
    frame.push(address);
    frame.push(FUNCTION_READ_HOLDING);
    frame.push(payload.len().min(u8::MAX as usize) as u8);
    frame.extend_from_slice(payload);

    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn check_crc(bytes: &[u8]) -> Result<u16, FrameError> {
    let split = bytes.len() - CRC_LEN;
    let received = u16::from_le_bytes([bytes[split], bytes[split + 1]]);
    let computed = crc16(&bytes[..split]);

    if received != computed {
        return Err(FrameError::CrcMismatch { received, computed });
    }
    Ok(received)
}
