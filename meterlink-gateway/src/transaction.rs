//! Modbus RTU transaction engine.
//!
//! One transaction switches the shared serial channel to the protocol
//! settings, sends a "read holding registers" request, collects the response
//! until the line goes quiet or the response deadline passes, and decodes it.
//! The channel is back on its original settings before the result is returned.

use std::io;
use std::time::Duration;

use meterlink_common::Reading;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{self, FrameError, RESPONSE_HEADER_LEN};
use crate::register_map::{
    self, DEFAULT_REGISTER_COUNT, DEFAULT_REGISTER_START, MIN_RESPONSE_LEN,
};
use crate::serial::{ChannelGuard, SerialChannel, SerialSettings};

/// Receive buffer capacity; longer responses are rejected.
pub const RX_CAPACITY: usize = 256;

/// Transaction errors.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Serial I/O error: {0}")]
    Serial(#[from] io::Error),
}

/// Parameters of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Modbus address of the meter.
    pub address: u8,
    pub register_start: u16,
    pub register_count: u16,
    /// Line settings the meter speaks Modbus with.
    pub protocol: SerialSettings,
    /// Absolute deadline for the whole response.
    pub response_timeout: Duration,
    /// Inter-byte silence that ends a response once the header is in.
    pub silence_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            address: 1,
            register_start: DEFAULT_REGISTER_START,
            register_count: DEFAULT_REGISTER_COUNT,
            protocol: SerialSettings::protocol_default(),
            response_timeout: Duration::from_millis(2000),
            silence_timeout: Duration::from_millis(150),
        }
    }
}

/// Owns the serial channel and drives request/response exchanges on it.
pub struct TransactionEngine<C: SerialChannel> {
    channel: C,
    config: TransactionConfig,
    /// Settings found on the channel at construction.
    original: SerialSettings,
    last: Reading,
    rx: Vec<u8>,
}

impl<C: SerialChannel> TransactionEngine<C> {
    /// Take ownership of `channel`, saving its current settings as the ones
    /// to restore after every transaction.
    pub fn new(channel: C, config: TransactionConfig) -> io::Result<Self> {
        let original = channel.settings()?;
        debug!(original = %original, protocol = %config.protocol, "Transaction engine ready");

        Ok(Self {
            channel,
            config,
            original,
            last: Reading::invalid(),
            rx: Vec::with_capacity(RX_CAPACITY),
        })
    }

    /// Outcome of the most recent transaction.
    ///
    /// Invalid after any failure; keeps the last decoded values.
    pub fn last_reading(&self) -> &Reading {
        &self.last
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Run one complete transaction.
    pub async fn read_once(&mut self) -> Result<Reading, TransactionError> {
        let outcome = match self.exchange().await {
            Ok(()) => codec::validate_response(&self.rx, self.config.address, MIN_RESPONSE_LEN)
                .and_then(register_map::decode_reading)
                .map_err(TransactionError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(reading) => {
                self.last = reading.clone();
                Ok(reading)
            }
            Err(e) => {
                self.last.invalidate();
                warn!(
                    address = self.config.address,
                    received = self.rx.len(),
                    error = %e,
                    "Meter transaction failed"
                );
                Err(e)
            }
        }
    }

    /// Send the request and collect the raw response into `rx`.
    ///
    /// The guard lives only inside this call, so the original settings are
    /// restored before the response is validated.
    async fn exchange(&mut self) -> Result<(), TransactionError> {
        let Self {
            channel,
            config,
            original,
            rx,
            ..
        } = self;

        rx.clear();
        let request = codec::build_request(
            config.address,
            config.register_start,
            config.register_count,
        );

        let mut guard = ChannelGuard::engage(channel, &config.protocol, *original)?;
        let port: &mut C = &mut guard;

        port.clear_input()?;
        port.write_all(request.as_bytes()).await?;
        port.flush().await?;
        trace!(frame = ?request.as_bytes(), "Request sent");

        let deadline = Instant::now() + config.response_timeout;
        let mut last_byte = Instant::now();
        let mut chunk = [0u8; 64];

        loop {
            let wait_until = if rx.len() > RESPONSE_HEADER_LEN {
                deadline.min(last_byte + config.silence_timeout)
            } else {
                deadline
            };

            match tokio::time::timeout_at(wait_until, port.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if rx.len() + n > RX_CAPACITY {
                        return Err(FrameError::Oversized {
                            capacity: RX_CAPACITY,
                        }
                        .into());
                    }
                    rx.extend_from_slice(&chunk[..n]);
                    last_byte = Instant::now();
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        trace!(len = rx.len(), frame = ?&rx[..], "Response collected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MeterBehavior, MockChannel, SimulatedMeter, sample_reading};

    fn engine_with_meter() -> (TransactionEngine<MockChannel>, SimulatedMeter) {
        let (channel, peer) = MockChannel::pair(SerialSettings::host_default());
        let meter = SimulatedMeter::new(1, sample_reading());
        meter.spawn(peer);

        let engine = TransactionEngine::new(channel, TransactionConfig::default()).unwrap();
        (engine, meter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_read() {
        let (mut engine, meter) = engine_with_meter();

        let reading = engine.read_once().await.unwrap();

        assert!(reading.is_valid());
        assert_eq!(reading.flow_rate(), 15.87);
        assert_eq!(reading.serial_number, sample_reading().serial_number);
        assert!(engine.last_reading().is_valid());
        assert_eq!(meter.requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_restored_after_success() {
        let (mut engine, _meter) = engine_with_meter();
        let history = engine.channel().history();

        engine.read_once().await.unwrap();

        assert_eq!(
            history.applied(),
            vec![
                SerialSettings::protocol_default(),
                SerialSettings::host_default()
            ]
        );
        assert_eq!(
            engine.channel().settings().unwrap(),
            SerialSettings::host_default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_meter_times_out_and_restores() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::Silent);
        let start = Instant::now();

        let result = engine.read_once().await;

        assert!(matches!(
            result,
            Err(TransactionError::Frame(FrameError::Incomplete { received: 0, .. }))
        ));
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert!(start.elapsed() < Duration::from_millis(2100));
        assert_eq!(
            engine.channel().settings().unwrap(),
            SerialSettings::host_default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_crc_invalidates_reading() {
        let (mut engine, meter) = engine_with_meter();
        engine.read_once().await.unwrap();

        meter.set_behavior(MeterBehavior::CorruptCrc);
        let result = engine.read_once().await;

        assert!(matches!(
            result,
            Err(TransactionError::Frame(FrameError::CrcMismatch { .. }))
        ));
        assert!(!engine.last_reading().is_valid());
        assert_eq!(engine.last_reading().flow_rate_raw, 1587);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_address_rejected() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::WrongAddress(9));

        let result = engine.read_once().await;

        assert!(matches!(
            result,
            Err(TransactionError::Frame(FrameError::HeaderMismatch { address: 9, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_ends_response_early() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::Stall {
            after: 40,
            pause: Duration::from_millis(500),
        });
        let start = Instant::now();

        let result = engine.read_once().await;

        // Truncated frame: the tail arrives after the silence window.
        assert!(matches!(
            result,
            Err(TransactionError::Frame(FrameError::Incomplete {
                received: 40,
                required: MIN_RESPONSE_LEN
            }))
        ));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_pause_within_silence_is_tolerated() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::Stall {
            after: 40,
            pause: Duration::from_millis(50),
        });

        assert!(engine.read_once().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_response_rejected() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::Flood(RX_CAPACITY + 64));

        let result = engine.read_once().await;

        assert!(matches!(
            result,
            Err(TransactionError::Frame(FrameError::Oversized { capacity: RX_CAPACITY }))
        ));
        assert_eq!(
            engine.channel().settings().unwrap(),
            SerialSettings::host_default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_is_serial_error() {
        let (mut engine, _meter) = engine_with_meter();
        engine.channel().history().fail_applies(true);

        let result = engine.read_once().await;

        assert!(matches!(result, Err(TransactionError::Serial(_))));
        assert!(!engine.last_reading().is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_applied_protocol_settings_are_restored() {
        let (mut engine, meter) = engine_with_meter();
        engine.channel().history().fail_next_apply_partially();

        let result = engine.read_once().await;

        assert!(matches!(result, Err(TransactionError::Serial(_))));
        assert_eq!(
            engine.channel().settings().unwrap(),
            SerialSettings::host_default()
        );
        assert_eq!(meter.requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure() {
        let (mut engine, meter) = engine_with_meter();
        meter.set_behavior(MeterBehavior::Silent);
        assert!(engine.read_once().await.is_err());

        meter.set_behavior(MeterBehavior::Respond);
        let reading = engine.read_once().await.unwrap();

        assert!(reading.is_valid());
        assert_eq!(meter.requests(), 2);
    }
}
