//! Reconfigurable serial channel.
//!
//! The meter port is shared between the host's default line settings and the
//! Modbus protocol settings. [`ChannelGuard`] applies the protocol settings
//! for the duration of one transaction and restores the saved ones on drop.

use std::io;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Flow control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Complete line settings of a serial channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    /// Settings the BOVE meter speaks Modbus with: 2400 baud, 8E1.
    pub fn protocol_default() -> Self {
        Self {
            baud_rate: 2400,
            data_bits: 8,
            parity: Parity::Even,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }

    /// Common host console settings: 115200 baud, 8N1.
    pub fn host_default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::protocol_default()
    }
}

impl std::fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, parity, self.stop_bits
        )
    }
}

/// An exclusively owned serial channel whose line settings can be changed.
pub trait SerialChannel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Current line settings.
    fn settings(&self) -> io::Result<SerialSettings>;

    /// Apply new line settings.
    fn apply(&mut self, settings: &SerialSettings) -> io::Result<()>;

    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl SerialChannel for SerialStream {
    fn settings(&self) -> io::Result<SerialSettings> {
        let data_bits = match self.data_bits()? {
            tokio_serial::DataBits::Five => 5,
            tokio_serial::DataBits::Six => 6,
            tokio_serial::DataBits::Seven => 7,
            tokio_serial::DataBits::Eight => 8,
        };
        let parity = match self.parity()? {
            tokio_serial::Parity::None => Parity::None,
            tokio_serial::Parity::Even => Parity::Even,
            tokio_serial::Parity::Odd => Parity::Odd,
        };
        let stop_bits = match self.stop_bits()? {
            tokio_serial::StopBits::One => 1,
            tokio_serial::StopBits::Two => 2,
        };
        let flow_control = match self.flow_control()? {
            tokio_serial::FlowControl::None => FlowControl::None,
            tokio_serial::FlowControl::Software => FlowControl::Software,
            tokio_serial::FlowControl::Hardware => FlowControl::Hardware,
        };

        Ok(SerialSettings {
            baud_rate: self.baud_rate()?,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        })
    }

    fn apply(&mut self, settings: &SerialSettings) -> io::Result<()> {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported data bits: {}", other),
                ));
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported stop bits: {}", other),
                ));
            }
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let flow_control = match settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        self.set_baud_rate(settings.baud_rate)?;
        self.set_data_bits(data_bits)?;
        self.set_parity(parity)?;
        self.set_stop_bits(stop_bits)?;
        self.set_flow_control(flow_control)?;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(tokio_serial::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Open a serial device with the given initial settings.
pub fn open(path: &str, settings: &SerialSettings) -> io::Result<SerialStream> {
    let mut stream = tokio_serial::new(path, settings.baud_rate)
        .open_native_async()
        .map_err(io::Error::from)?;
    stream.apply(settings)?;
    Ok(stream)
}

/// Scoped protocol configuration.
///
/// While alive the channel runs with the protocol settings; dropping the
/// guard restores the saved settings on every exit path.
pub struct ChannelGuard<'a, C: SerialChannel> {
    channel: &'a mut C,
    restore: SerialSettings,
}

impl<'a, C: SerialChannel> ChannelGuard<'a, C> {
    /// Switch `channel` to `protocol`, remembering `restore` for drop.
    ///
    /// The guard exists before the switch, so a channel left half
    /// configured by a failed `apply` is restored as well.
    pub fn engage(
        channel: &'a mut C,
        protocol: &SerialSettings,
        restore: SerialSettings,
    ) -> io::Result<Self> {
        let mut guard = Self { channel, restore };
        guard.channel.apply(protocol)?;
        Ok(guard)
    }
}

impl<C: SerialChannel> Deref for ChannelGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.channel
    }
}

impl<C: SerialChannel> DerefMut for ChannelGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.channel
    }
}

impl<C: SerialChannel> Drop for ChannelGuard<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.channel.apply(&self.restore) {
            tracing::error!(
                settings = %self.restore,
                error = %e,
                "Failed to restore serial settings"
            );
        } else {
            tracing::trace!(settings = %self.restore, "Serial settings restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;

    #[test]
    fn test_settings_display() {
        assert_eq!(SerialSettings::protocol_default().to_string(), "2400 8E1");
        assert_eq!(SerialSettings::host_default().to_string(), "115200 8N1");
    }

    #[test]
    fn test_settings_deserialize() {
        let settings: SerialSettings = json5::from_str(
            r#"{ baud_rate: 9600, data_bits: 8, parity: "odd", stop_bits: 2, flow_control: "none" }"#,
        )
        .unwrap();

        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.stop_bits, 2);
    }

    #[tokio::test]
    async fn test_guard_restores_on_drop() {
        let (mut channel, _meter) = MockChannel::pair(SerialSettings::host_default());
        let history = channel.history();

        {
            let guard = ChannelGuard::engage(
                &mut channel,
                &SerialSettings::protocol_default(),
                SerialSettings::host_default(),
            )
            .unwrap();
            assert_eq!(guard.settings().unwrap(), SerialSettings::protocol_default());
        }

        assert_eq!(channel.settings().unwrap(), SerialSettings::host_default());
        assert_eq!(
            history.applied(),
            vec![
                SerialSettings::protocol_default(),
                SerialSettings::host_default()
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_engage_restores_partial_switch() {
        let (mut channel, _meter) = MockChannel::pair(SerialSettings::host_default());
        let history = channel.history();
        history.fail_next_apply_partially();

        let result = ChannelGuard::engage(
            &mut channel,
            &SerialSettings::protocol_default(),
            SerialSettings::host_default(),
        );

        assert!(result.is_err());
        drop(result);
        assert_eq!(channel.settings().unwrap(), SerialSettings::host_default());
        assert_eq!(history.applied(), vec![SerialSettings::host_default()]);
    }
}
