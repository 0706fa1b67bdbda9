//! Holding-register map of the BOVE ultrasonic water meter.
//!
//! Offsets are byte offsets into the response payload. The meter stores
//! 32-bit quantities as two registers with the LOW register first, each
//! register big-endian; the serial number is the only plain big-endian u32.

use meterlink_common::{BaudRate, Reading, StatusWord, current_timestamp_millis};

use crate::codec::{CRC_LEN, FrameError, RESPONSE_HEADER_LEN};

pub const FLOW_RATE: usize = 0;
pub const FORWARD_TOTAL: usize = 12;
pub const REVERSE_TOTAL: usize = 18;
pub const PRESSURE: usize = 36;
pub const STATUS: usize = 38;
pub const TEMPERATURE: usize = 58;
pub const SERIAL_NUMBER: usize = 64;
pub const DEVICE_ADDRESS: usize = 69;
pub const BAUD_CODE: usize = 72;

/// Smallest payload that covers every mapped field.
pub const MIN_PAYLOAD_LEN: usize = BAUD_CODE + 2;

/// Shortest response frame that can carry [`MIN_PAYLOAD_LEN`].
pub const MIN_RESPONSE_LEN: usize = RESPONSE_HEADER_LEN + MIN_PAYLOAD_LEN + CRC_LEN;

/// First register of the map.
pub const DEFAULT_REGISTER_START: u16 = 0x0001;

/// Registers requested per poll (38 registers, 76 payload bytes).
pub const DEFAULT_REGISTER_COUNT: u16 = 0x0026;

fn register(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

/// Assemble a 32-bit value stored low register first.
fn low_high_u32(payload: &[u8], offset: usize) -> u32 {
    let low = u32::from(register(payload, offset));
    let high = u32::from(register(payload, offset + 2));
    (high << 16) | low
}

fn be_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ])
}

/// Decode a validated payload into a valid [`Reading`].
pub fn decode_reading(payload: &[u8]) -> Result<Reading, FrameError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(FrameError::Incomplete {
            received: payload.len(),
            required: MIN_PAYLOAD_LEN,
        });
    }

    Ok(Reading {
        flow_rate_raw: low_high_u32(payload, FLOW_RATE),
        forward_total_raw: low_high_u32(payload, FORWARD_TOTAL),
        reverse_total_raw: low_high_u32(payload, REVERSE_TOTAL),
        pressure_raw: register(payload, PRESSURE),
        temperature_raw: register(payload, TEMPERATURE),
        status: StatusWord(register(payload, STATUS)),
        serial_number: be_u32(payload, SERIAL_NUMBER),
        device_address: payload[DEVICE_ADDRESS],
        baud_rate: BaudRate::from_code(register(payload, BAUD_CODE)),
        valid: true,
        timestamp: current_timestamp_millis(),
    })
}

/// Lay out `reading` as the meter would report it.
///
/// Inverse of [`decode_reading`]; used by the simulated meter.
pub fn encode_payload(reading: &Reading, register_count: u16) -> Vec<u8> {
    let len = (usize::from(register_count) * 2).max(MIN_PAYLOAD_LEN);
    let mut payload = vec![0u8; len];

    let mut put_u16 = |offset: usize, value: u16| {
        payload[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    };
    put_u16(FLOW_RATE, reading.flow_rate_raw as u16);
    put_u16(FLOW_RATE + 2, (reading.flow_rate_raw >> 16) as u16);
    put_u16(FORWARD_TOTAL, reading.forward_total_raw as u16);
    put_u16(FORWARD_TOTAL + 2, (reading.forward_total_raw >> 16) as u16);
    put_u16(REVERSE_TOTAL, reading.reverse_total_raw as u16);
    put_u16(REVERSE_TOTAL + 2, (reading.reverse_total_raw >> 16) as u16);
    put_u16(PRESSURE, reading.pressure_raw);
    put_u16(STATUS, reading.status.bits());
    put_u16(TEMPERATURE, reading.temperature_raw);
    put_u16(BAUD_CODE, baud_code(reading.baud_rate));

    payload[SERIAL_NUMBER..SERIAL_NUMBER + 4].copy_from_slice(&reading.serial_number.to_be_bytes());
    payload[DEVICE_ADDRESS] = reading.device_address;
    payload
}

fn baud_code(baud: BaudRate) -> u16 {
    match baud {
        BaudRate::B9600 => 0,
        BaudRate::B2400 => 1,
        BaudRate::B4800 => 2,
        BaudRate::B1200 => 3,
        BaudRate::Unknown => 0xFFFF,
    }
}
