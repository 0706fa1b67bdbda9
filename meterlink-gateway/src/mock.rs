//! In-memory serial channel, simulated meter and scripted link driver.
//!
//! Used by the test suites and by the `serial.simulate` bench mode, where the
//! gateway runs its full cycle against a simulated meter instead of a port.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use meterlink_common::{BaudRate, Reading, StatusWord};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::codec::{self, REQUEST_LEN};
use crate::link::{LinkCredentials, LinkDriver, LinkError, LinkNotifier};
use crate::register_map;
use crate::serial::{SerialChannel, SerialSettings};

/// A reading with easily recognisable values: 15.87 L/h, 123.456 m³, 21.5 °C.
pub fn sample_reading() -> Reading {
    Reading {
        flow_rate_raw: 1587,
        forward_total_raw: 123_456,
        reverse_total_raw: 42,
        pressure_raw: 350,
        temperature_raw: 2150,
        status: StatusWord(0),
        serial_number: 0x2024_0101,
        device_address: 1,
        baud_rate: BaudRate::B2400,
        valid: true,
        timestamp: 0,
    }
}

/// Shared record of the settings applied to a [`MockChannel`].
#[derive(Debug, Clone, Default)]
pub struct SettingsHistory {
    applied: Arc<Mutex<Vec<SerialSettings>>>,
    fail: Arc<AtomicBool>,
    partial: Arc<AtomicBool>,
}

impl SettingsHistory {
    /// Every successfully applied setting, oldest first.
    pub fn applied(&self) -> Vec<SerialSettings> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent `apply` calls fail.
    pub fn fail_applies(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next `apply` switch the baud rate and then fail on the
    /// framing, leaving the channel half configured.
    pub fn fail_next_apply_partially(&self) {
        self.partial.store(true, Ordering::SeqCst);
    }
}

/// Serial channel backed by an in-memory duplex pipe.
#[derive(Debug)]
pub struct MockChannel {
    stream: DuplexStream,
    current: SerialSettings,
    history: SettingsHistory,
}

impl MockChannel {
    /// Create a channel and the peer end a simulated device talks on.
    pub fn pair(initial: SerialSettings) -> (Self, DuplexStream) {
        let (stream, peer) = tokio::io::duplex(1024);
        let channel = Self {
            stream,
            current: initial,
            history: SettingsHistory::default(),
        };
        (channel, peer)
    }

    pub fn history(&self) -> SettingsHistory {
        self.history.clone()
    }
}

impl SerialChannel for MockChannel {
    fn settings(&self) -> io::Result<SerialSettings> {
        Ok(self.current)
    }

    fn apply(&mut self, settings: &SerialSettings) -> io::Result<()> {
        if self.history.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated settings failure"));
        }
        if self.history.partial.swap(false, Ordering::SeqCst) {
            self.current.baud_rate = settings.baud_rate;
            return Err(io::Error::other("simulated parity failure"));
        }
        self.current = *settings;
        self.history
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*settings);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut cx = Context::from_waker(Waker::noop());
        let mut scratch = [0u8; 64];

        loop {
            let mut buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
                Poll::Ready(Ok(())) if !buf.filled().is_empty() => {
                    trace!(discarded = buf.filled().len(), "Stale input discarded");
                }
                Poll::Ready(Ok(())) | Poll::Pending => return Ok(()),
                Poll::Ready(Err(e)) => return Err(e),
            }
        }
    }
}

impl AsyncRead for MockChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// How the simulated meter answers a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterBehavior {
    /// Well-formed response.
    Respond,
    /// No response at all.
    Silent,
    /// Response with the last checksum byte flipped.
    CorruptCrc,
    /// Response claiming another slave address.
    WrongAddress(u8),
    /// Send `after` bytes, pause, then send the rest.
    Stall { after: usize, pause: Duration },
    /// Stream `n` filler bytes.
    Flood(usize),
}

/// Modbus slave answering "read holding registers" with a fixed reading.
#[derive(Debug, Clone)]
pub struct SimulatedMeter {
    address: u8,
    reading: Arc<Mutex<Reading>>,
    behavior: Arc<Mutex<MeterBehavior>>,
    requests: Arc<AtomicUsize>,
}

impl SimulatedMeter {
    pub fn new(address: u8, reading: Reading) -> Self {
        Self {
            address,
            reading: Arc::new(Mutex::new(reading)),
            behavior: Arc::new(Mutex::new(MeterBehavior::Respond)),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_behavior(&self, behavior: MeterBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Requests received so far, answered or not.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Serve requests arriving on `stream` until the other end closes.
    pub fn spawn(&self, stream: DuplexStream) -> JoinHandle<()> {
        let meter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = meter.serve(stream).await {
                debug!(error = %e, "Simulated meter stopped");
            }
        })
    }

    async fn serve(&self, mut stream: DuplexStream) -> io::Result<()> {
        let mut request = [0u8; REQUEST_LEN];

        loop {
            stream.read_exact(&mut request).await?;
            self.requests.fetch_add(1, Ordering::SeqCst);

            let request = match codec::parse_request(&request) {
                Ok(request) if request.address() == self.address => request,
                Ok(request) => {
                    trace!(address = request.address(), "Request for another slave");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Simulated meter ignored malformed request");
                    continue;
                }
            };

            let reading = self
                .reading
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let payload = register_map::encode_payload(&reading, request.register_count());
            let behavior = self
                .behavior
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            match behavior {
                MeterBehavior::Respond => {
                    stream
                        .write_all(&codec::encode_response(self.address, &payload))
                        .await?;
                }
                MeterBehavior::Silent => {}
                MeterBehavior::CorruptCrc => {
                    let mut frame = codec::encode_response(self.address, &payload);
                    if let Some(last) = frame.last_mut() {
                        *last ^= 0xFF;
                    }
                    stream.write_all(&frame).await?;
                }
                MeterBehavior::WrongAddress(address) => {
                    stream
                        .write_all(&codec::encode_response(address, &payload))
                        .await?;
                }
                MeterBehavior::Stall { after, pause } => {
                    let frame = codec::encode_response(self.address, &payload);
                    let split = after.min(frame.len());
                    stream.write_all(&frame[..split]).await?;
                    tokio::time::sleep(pause).await;
                    stream.write_all(&frame[split..]).await?;
                }
                MeterBehavior::Flood(n) => {
                    stream.write_all(&vec![0x55; n]).await?;
                }
            }
        }
    }
}

/// What a [`MockLinkDriver`] does when asked to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScript {
    /// Accept the request and never report anything.
    NeverSignal,
    /// Report a successful association, then an address.
    Succeed,
    /// Report a failed association with this status.
    Reject(i32),
    /// Associate but never get an address.
    NoAddress,
    /// Refuse the request itself.
    FailRequest,
}

/// Link driver that replays a script through a [`LinkNotifier`].
#[derive(Debug, Clone)]
pub struct MockLinkDriver {
    notifier: LinkNotifier,
    script: Arc<Mutex<LinkScript>>,
    requests: Arc<AtomicUsize>,
    latency: Duration,
}

impl MockLinkDriver {
    pub fn new(notifier: LinkNotifier, script: LinkScript) -> Self {
        Self {
            notifier,
            script: Arc::new(Mutex::new(script)),
            requests: Arc::new(AtomicUsize::new(0)),
            latency: Duration::from_millis(100),
        }
    }

    pub fn set_script(&self, script: LinkScript) {
        *self.script.lock().unwrap_or_else(PoisonError::into_inner) = script;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Simulate the access point dropping the association.
    pub fn drop_link(&self) {
        self.notifier.disconnected();
    }
}

impl LinkDriver for MockLinkDriver {
    async fn request_connect(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap_or_else(PoisonError::into_inner);
        trace!(ssid = %credentials.ssid, ?script, "Mock link connect requested");

        let notifier = self.notifier.clone();
        let latency = self.latency;

        match script {
            LinkScript::NeverSignal => {}
            LinkScript::FailRequest => {
                return Err(LinkError::Request("mock driver refused".to_string()));
            }
            LinkScript::Succeed => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    notifier.connect_result(Ok(()));
                    tokio::time::sleep(latency).await;
                    notifier.address_assigned([192, 168, 4, 2].into());
                });
            }
            LinkScript::Reject(status) => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    notifier.connect_result(Err(status));
                });
            }
            LinkScript::NoAddress => {
                tokio::spawn(async move {
                    tokio::time::sleep(latency).await;
                    notifier.connect_result(Ok(()));
                });
            }
        }

        Ok(())
    }
}
