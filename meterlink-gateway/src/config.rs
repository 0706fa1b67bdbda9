//! Configuration for the meter gateway.

use std::path::Path;
use std::time::Duration;

use meterlink_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::LinkCredentials;
use crate::retry::RetryPolicy;
use crate::serial::SerialSettings;
use crate::session::{SessionConfig, SessionCredentials};
use crate::transaction::{RX_CAPACITY, TransactionConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] meterlink_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Serial port settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Meter addressing and response timing
    #[serde(default)]
    pub meter: MeterConfig,

    /// Wireless link
    pub link: LinkConfig,

    /// MQTT collector
    pub collector: CollectorConfig,

    /// Acquisition cycle
    #[serde(default)]
    pub cycle: CycleConfig,

    /// Identity published in the attributes message
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (e.g., "/dev/ttyUSB0")
    #[serde(default = "default_serial_port")]
    pub port: String,

    /// Poll a simulated meter instead of opening the port
    #[serde(default)]
    pub simulate: bool,

    /// Settings the port is opened with and restored to between transactions
    #[serde(default = "SerialSettings::host_default")]
    pub default: SerialSettings,

    /// Settings used while talking Modbus to the meter (default: 2400 8E1)
    #[serde(default = "SerialSettings::protocol_default")]
    pub protocol: SerialSettings,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            simulate: false,
            default: SerialSettings::host_default(),
            protocol: SerialSettings::protocol_default(),
        }
    }
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

/// Meter addressing and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// First holding register
    #[serde(default = "default_register_start")]
    pub register_start: u16,

    /// Number of holding registers per poll
    #[serde(default = "default_register_count")]
    pub register_count: u16,

    /// Absolute response deadline in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Inter-byte silence ending a response, in milliseconds
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            unit_id: default_unit_id(),
            register_start: default_register_start(),
            register_count: default_register_count(),
            response_timeout_ms: default_response_timeout_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
        }
    }
}

fn default_unit_id() -> u8 {
    1
}

fn default_register_start() -> u16 {
    crate::register_map::DEFAULT_REGISTER_START
}

fn default_register_count() -> u16 {
    crate::register_map::DEFAULT_REGISTER_COUNT
}

fn default_response_timeout_ms() -> u64 {
    2000
}

fn default_silence_timeout_ms() -> u64 {
    150
}

impl MeterConfig {
    /// Transaction parameters using `protocol` line settings.
    pub fn transaction_config(&self, protocol: SerialSettings) -> TransactionConfig {
        TransactionConfig {
            address: self.unit_id,
            register_start: self.register_start,
            register_count: self.register_count,
            protocol,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            silence_timeout: Duration::from_millis(self.silence_timeout_ms),
        }
    }
}

/// Wireless link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub ssid: String,

    pub passphrase: String,

    /// Network interface to supervise
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Association command; `{ssid}`, `{psk}` and `{interface}` are substituted.
    /// Empty: the interface is associated by the system.
    #[serde(default)]
    pub connect_command: Vec<String>,

    /// Interface poll interval in milliseconds
    #[serde(default = "default_link_poll_ms")]
    pub poll_interval_ms: u64,

    /// Address probed to discover the outbound source address
    #[serde(default = "default_probe_address")]
    pub probe_address: String,

    /// Attempts per connect
    #[serde(default = "default_link_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts in milliseconds
    #[serde(default = "default_link_delay_ms")]
    pub retry_delay_ms: u64,

    /// Wait for each platform report in milliseconds
    #[serde(default = "default_link_timeout_ms")]
    pub timeout_ms: u64,

    /// Connect rounds at startup before entering degraded mode
    #[serde(default = "default_startup_rounds")]
    pub startup_rounds: u32,

    /// Pause between startup rounds in milliseconds
    #[serde(default = "default_startup_round_delay_ms")]
    pub startup_round_delay_ms: u64,
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_link_poll_ms() -> u64 {
    1000
}

fn default_probe_address() -> String {
    "1.1.1.1:53".to_string()
}

fn default_link_attempts() -> u32 {
    10
}

fn default_link_delay_ms() -> u64 {
    5000
}

fn default_link_timeout_ms() -> u64 {
    30_000
}

fn default_startup_rounds() -> u32 {
    3
}

fn default_startup_round_delay_ms() -> u64 {
    10_000
}

impl LinkConfig {
    pub fn credentials(&self) -> LinkCredentials {
        LinkCredentials {
            ssid: self.ssid.clone(),
            passphrase: self.passphrase.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_delay_ms, self.timeout_ms)
    }
}

/// MQTT collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Broker host name (default: "thingsboard.cloud")
    #[serde(default = "default_collector_host")]
    pub host: String,

    /// Broker port (default: 1883)
    #[serde(default = "default_collector_port")]
    pub port: u16,

    /// Device access token, sent as the MQTT username
    pub access_token: String,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Maximum MQTT packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Handshake attempts
    #[serde(default = "default_session_attempts")]
    pub max_attempts: u32,

    /// Backoff between handshake attempts in milliseconds
    #[serde(default = "default_session_delay_ms")]
    pub retry_delay_ms: u64,

    /// Handshake timeout per attempt in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default = "default_telemetry_topic")]
    pub telemetry_topic: String,

    #[serde(default = "default_attributes_topic")]
    pub attributes_topic: String,

    /// Publish scaled physical values or the raw register integers.
    #[serde(default)]
    pub telemetry_values: TelemetryValues,
}

/// Representation of the numeric telemetry fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryValues {
    /// L/h, m³, MPa and °C as floating point.
    #[default]
    Scaled,
    /// Register values exactly as read from the meter.
    Raw,
}

fn default_collector_host() -> String {
    "thingsboard.cloud".to_string()
}

fn default_collector_port() -> u16 {
    1883
}

fn default_client_id_prefix() -> String {
    "bove_meter".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_max_packet_size() -> usize {
    1024
}

fn default_session_attempts() -> u32 {
    5
}

fn default_session_delay_ms() -> u64 {
    2000
}

fn default_session_timeout_ms() -> u64 {
    5000
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_telemetry_topic() -> String {
    "v1/devices/me/telemetry".to_string()
}

fn default_attributes_topic() -> String {
    "v1/devices/me/attributes".to_string()
}

impl CollectorConfig {
    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            access_token: self.access_token.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_id_prefix: self.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            max_packet_size: self.max_packet_size,
            handshake: RetryPolicy::new(self.max_attempts, self.retry_delay_ms, self.timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            ..SessionConfig::default()
        }
    }
}

/// Acquisition cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Seconds between transactions
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Run a health check every N cycles
    #[serde(default = "default_health_check_every")]
    pub health_check_every: u64,

    /// Delay before the first connect, in seconds
    #[serde(default)]
    pub startup_delay_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            health_check_every: default_health_check_every(),
            startup_delay_secs: 0,
        }
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_health_check_every() -> u64 {
    10
}

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,

    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            firmware_version: default_firmware_version(),
            model: default_model(),
        }
    }
}

fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_model() -> String {
    "BOVE-Modbus-Meter".to_string()
}

fn validate_line(name: &str, settings: &SerialSettings) -> Result<(), ConfigError> {
    if settings.baud_rate == 0 {
        return Err(ConfigError::Validation(format!(
            "serial.{}: baud_rate must be positive",
            name
        )));
    }
    if !(5..=8).contains(&settings.data_bits) {
        return Err(ConfigError::Validation(format!(
            "serial.{}: data_bits must be 5-8",
            name
        )));
    }
    if !matches!(settings.stop_bits, 1 | 2) {
        return Err(ConfigError::Validation(format!(
            "serial.{}: stop_bits must be 1 or 2",
            name
        )));
    }
    Ok(())
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: GatewayConfig = meterlink_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration given as JSON5 text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = meterlink_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.serial.simulate && self.serial.port.is_empty() {
            return Err(ConfigError::Validation(
                "serial.port cannot be empty".to_string(),
            ));
        }
        validate_line("default", &self.serial.default)?;
        validate_line("protocol", &self.serial.protocol)?;

        if self.meter.unit_id == 0 || self.meter.unit_id > 247 {
            return Err(ConfigError::Validation(
                "meter.unit_id must be 1-247".to_string(),
            ));
        }

        let min_registers = crate::register_map::MIN_PAYLOAD_LEN.div_ceil(2) as u16;
        let max_registers = ((RX_CAPACITY - 5) / 2) as u16;
        if self.meter.register_count < min_registers || self.meter.register_count > max_registers {
            return Err(ConfigError::Validation(format!(
                "meter.register_count must be {}-{}",
                min_registers, max_registers
            )));
        }

        if self.meter.response_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "meter.response_timeout_ms must be positive".to_string(),
            ));
        }
        if self.meter.silence_timeout_ms >= self.meter.response_timeout_ms {
            return Err(ConfigError::Validation(
                "meter.silence_timeout_ms must be below response_timeout_ms".to_string(),
            ));
        }

        if self.link.ssid.is_empty() {
            return Err(ConfigError::Validation(
                "link.ssid cannot be empty".to_string(),
            ));
        }
        if self.link.interface.is_empty() {
            return Err(ConfigError::Validation(
                "link.interface cannot be empty".to_string(),
            ));
        }
        if self.link.max_attempts == 0 || self.link.startup_rounds == 0 {
            return Err(ConfigError::Validation(
                "link.max_attempts and link.startup_rounds must be positive".to_string(),
            ));
        }

        if self.collector.host.is_empty() {
            return Err(ConfigError::Validation(
                "collector.host cannot be empty".to_string(),
            ));
        }
        if self.collector.access_token.is_empty() {
            return Err(ConfigError::Validation(
                "collector.access_token cannot be empty".to_string(),
            ));
        }
        if self.collector.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "collector.max_attempts must be positive".to_string(),
            ));
        }
        if self.collector.keep_alive_secs < 5 {
            return Err(ConfigError::Validation(
                "collector.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.collector.telemetry_topic.is_empty() || self.collector.attributes_topic.is_empty()
        {
            return Err(ConfigError::Validation(
                "collector topics cannot be empty".to_string(),
            ));
        }

        if self.cycle.interval_secs == 0 || self.cycle.health_check_every == 0 {
            return Err(ConfigError::Validation(
                "cycle.interval_secs and cycle.health_check_every must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
