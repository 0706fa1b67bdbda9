//! Meter reading data model and the messages published to the collector.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Status bit raised when the pipe is empty (no medium in the sensor).
pub const STATUS_EMPTY: u16 = 0x0004;

/// Status bit raised when the meter battery is low.
pub const STATUS_LOW_BATTERY: u16 = 0x0020;

/// Meter status register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// Raw register value.
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// No status bit is set.
    pub fn is_normal(&self) -> bool {
        self.0 == 0
    }

    /// Empty pipe / depleted condition.
    pub fn is_empty(&self) -> bool {
        self.0 & STATUS_EMPTY != 0
    }

    /// Low battery / low power condition.
    pub fn is_low_battery(&self) -> bool {
        self.0 & STATUS_LOW_BATTERY != 0
    }

    /// Short human-readable summary for log lines.
    pub fn describe(&self) -> &'static str {
        if self.is_normal() {
            "normal"
        } else if self.is_empty() {
            "empty"
        } else if self.is_low_battery() {
            "low battery"
        } else {
            "flagged"
        }
    }
}

impl std::fmt::Display for StatusWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Serial speed the meter reports for its own Modbus port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaudRate {
    B9600,
    B2400,
    B4800,
    B1200,
    /// Code outside the documented range.
    #[default]
    Unknown,
}

impl BaudRate {
    /// Decode the meter's baud-rate register.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => BaudRate::B9600,
            1 => BaudRate::B2400,
            2 => BaudRate::B4800,
            3 => BaudRate::B1200,
            _ => BaudRate::Unknown,
        }
    }

    /// Label used in the attributes message.
    pub fn as_str(&self) -> &'static str {
        match self {
            BaudRate::B9600 => "9600",
            BaudRate::B2400 => "2400",
            BaudRate::B4800 => "4800",
            BaudRate::B1200 => "1200",
            BaudRate::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded meter reading.
///
/// Values are kept exactly as the meter reports them; the accessor methods
/// apply the register map's fixed scale factors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Instantaneous flow, L/h × 100.
    pub flow_rate_raw: u32,
    /// Forward accumulated volume, m³ × 1000.
    pub forward_total_raw: u32,
    /// Reverse accumulated volume, m³ × 1000.
    pub reverse_total_raw: u32,
    /// Line pressure, MPa × 1000.
    pub pressure_raw: u16,
    /// Water temperature, °C × 100.
    pub temperature_raw: u16,
    pub status: StatusWord,
    pub serial_number: u32,
    /// Modbus address the meter reports for itself.
    pub device_address: u8,
    pub baud_rate: BaudRate,
    /// Set only after length, CRC, address and function code checks passed.
    pub valid: bool,
    /// Unix epoch milliseconds when the frame was decoded.
    pub timestamp: i64,
}

impl Reading {
    /// An empty, invalid reading.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Clear the validity flag, keeping the last decoded values for inspection.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Flow rate in L/h.
    pub fn flow_rate(&self) -> f64 {
        f64::from(self.flow_rate_raw) / 100.0
    }

    /// Forward total in m³.
    pub fn forward_total(&self) -> f64 {
        f64::from(self.forward_total_raw) / 1000.0
    }

    /// Reverse total in m³.
    pub fn reverse_total(&self) -> f64 {
        f64::from(self.reverse_total_raw) / 1000.0
    }

    /// Pressure in MPa.
    pub fn pressure(&self) -> f64 {
        f64::from(self.pressure_raw) / 1000.0
    }

    /// Temperature in °C.
    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_raw) / 100.0
    }

    /// Serial number formatted the way the meter nameplate prints it.
    pub fn serial_label(&self) -> String {
        format!("{:08X}", self.serial_number)
    }
}

/// Telemetry message published on every valid reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub flow_rate: f64,
    pub forward_total: f64,
    pub reverse_total: f64,
    pub pressure: f64,
    pub temperature: f64,
    pub status: u16,
    /// 1 when the empty-pipe bit is set.
    pub empty: u8,
    /// 1 when the low-battery bit is set.
    pub low_battery: u8,
}

impl From<&Reading> for TelemetryMessage {
    fn from(reading: &Reading) -> Self {
        Self {
            flow_rate: reading.flow_rate(),
            forward_total: reading.forward_total(),
            reverse_total: reading.reverse_total(),
            pressure: reading.pressure(),
            temperature: reading.temperature(),
            status: reading.status.bits(),
            empty: u8::from(reading.status.is_empty()),
            low_battery: u8::from(reading.status.is_low_battery()),
        }
    }
}

/// Telemetry with the register values as the meter reports them, unscaled.
///
/// Same field names as [`TelemetryMessage`], for collectors whose dashboards
/// apply the scale factors themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTelemetryMessage {
    pub flow_rate: u32,
    pub forward_total: u32,
    pub reverse_total: u32,
    pub pressure: u16,
    pub temperature: u16,
    pub status: u16,
    pub empty: u8,
    pub low_battery: u8,
}

impl From<&Reading> for RawTelemetryMessage {
    fn from(reading: &Reading) -> Self {
        Self {
            flow_rate: reading.flow_rate_raw,
            forward_total: reading.forward_total_raw,
            reverse_total: reading.reverse_total_raw,
            pressure: reading.pressure_raw,
            temperature: reading.temperature_raw,
            status: reading.status.bits(),
            empty: u8::from(reading.status.is_empty()),
            low_battery: u8::from(reading.status.is_low_battery()),
        }
    }
}

/// Device identity published once per collector session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesMessage {
    pub firmware_version: String,
    pub device_model: String,
    pub serial_number: String,
    pub modbus_id: u8,
    pub baud_rate: String,
}

impl AttributesMessage {
    /// Build the attributes for a meter identified by `reading`.
    pub fn new(
        firmware_version: impl Into<String>,
        device_model: impl Into<String>,
        reading: &Reading,
    ) -> Self {
        Self {
            firmware_version: firmware_version.into(),
            device_model: device_model.into(),
            serial_number: reading.serial_label(),
            modbus_id: reading.device_address,
            baud_rate: reading.baud_rate.as_str().to_string(),
        }
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Reading {
        Reading {
            flow_rate_raw: 1587,
            forward_total_raw: 123_456,
            reverse_total_raw: 42,
            pressure_raw: 350,
            temperature_raw: 2150,
            status: StatusWord(STATUS_LOW_BATTERY),
            serial_number: 0x2024_0101,
            device_address: 1,
            baud_rate: BaudRate::B2400,
            valid: true,
            timestamp: 0,
        }
    }

    #[test]
    fn test_scaled_values() {
        let reading = sample();

        assert_eq!(reading.flow_rate(), 15.87);
        assert_eq!(reading.forward_total(), 123.456);
        assert_eq!(reading.reverse_total(), 0.042);
        assert_eq!(reading.pressure(), 0.35);
        assert_eq!(reading.temperature(), 21.5);
    }

    #[test]
    fn test_raw_telemetry_keeps_register_values() {
        let message = RawTelemetryMessage::from(&sample());

        assert_eq!(message.flow_rate, 1587);
        assert_eq!(message.forward_total, 123_456);
        assert_eq!(message.temperature, 2150);
        assert_eq!(message.low_battery, 1);
        assert_eq!(message.empty, 0);
    }

    #[test]
    fn test_status_bits() {
        assert!(StatusWord(0).is_normal());
        assert!(StatusWord(0x0004).is_empty());
        assert!(!StatusWord(0x0004).is_low_battery());
        assert!(StatusWord(0x0020).is_low_battery());
        assert!(!StatusWord(0x0020).is_empty());
        assert_eq!(StatusWord(0x0024).describe(), "empty");
        assert_eq!(StatusWord(0x0100).describe(), "flagged");
        assert_eq!(StatusWord(0x0024).to_string(), "0x0024");
    }

    #[test]
    fn test_baud_codes() {
        assert_eq!(BaudRate::from_code(0), BaudRate::B9600);
        assert_eq!(BaudRate::from_code(1), BaudRate::B2400);
        assert_eq!(BaudRate::from_code(2), BaudRate::B4800);
        assert_eq!(BaudRate::from_code(3), BaudRate::B1200);
        assert_eq!(BaudRate::from_code(4), BaudRate::Unknown);
        assert_eq!(BaudRate::from_code(0xFFFF).as_str(), "unknown");
    }

    #[test]
    fn test_invalidate_keeps_values() {
        let mut reading = sample();
        reading.invalidate();

        assert!(!reading.is_valid());
        assert_eq!(reading.flow_rate_raw, 1587);
        assert!(!Reading::invalid().is_valid());
    }

    #[test]
    fn test_telemetry_message_fields() {
        let message = TelemetryMessage::from(&sample());
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["flowRate"], 15.87);
        assert_eq!(json["forwardTotal"], 123.456);
        assert_eq!(json["status"], 0x20);
        assert_eq!(json["empty"], 0);
        assert_eq!(json["lowBattery"], 1);
    }

    #[test]
    fn test_attributes_message_fields() {
        let message = AttributesMessage::new("2.0.0", "BOVE-Modbus-Meter", &sample());
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["firmwareVersion"], "2.0.0");
        assert_eq!(json["deviceModel"], "BOVE-Modbus-Meter");
        assert_eq!(json["serialNumber"], "20240101");
        assert_eq!(json["modbusId"], 1);
        assert_eq!(json["baudRate"], "2400");
    }
}
