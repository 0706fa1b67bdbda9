//! Shared helpers for the gateway integration tests.
//!
//! [`FakeBroker`] speaks just enough MQTT 3.1.1 over a real TCP socket to
//! exercise the transport session: CONNECT/CONNACK, PUBLISH/PUBACK,
//! PINGREQ/PINGRESP and DISCONNECT.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meterlink_gateway::config::GatewayConfig;
use meterlink_gateway::session::SessionCredentials;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// CONNACK return code "not authorized".
pub const REFUSED_NOT_AUTHORIZED: u8 = 5;

/// A CONNECT packet as seen by the broker.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub keep_alive: u16,
}

/// A PUBLISH packet as seen by the broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: u8,
    pub pkid: Option<u16>,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("Payload is not JSON")
    }
}

#[derive(Default)]
struct BrokerState {
    accept: AtomicBool,
    silent: AtomicBool,
    connects: AtomicUsize,
    connections: Mutex<Vec<ConnectInfo>>,
    publishes: Mutex<Vec<Published>>,
    kick: Notify,
}

/// In-process MQTT broker on 127.0.0.1.
#[derive(Clone)]
pub struct FakeBroker {
    pub address: SocketAddr,
    state: Arc<BrokerState>,
}

impl FakeBroker {
    /// Start a broker that accepts every session.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind broker");
        let address = listener.local_addr().expect("No local address");
        let state = Arc::new(BrokerState::default());
        state.accept.store(true, Ordering::SeqCst);

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state).await;
                });
            }
        });

        Self { address, state }
    }

    /// Accept (`true`) or refuse (`false`) subsequent sessions.
    pub fn set_accept(&self, accept: bool) {
        self.state.accept.store(accept, Ordering::SeqCst);
    }

    /// Never answer CONNECT.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Close every open connection.
    pub fn kick(&self) {
        self.state.kick.notify_waiters();
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<ConnectInfo> {
        self.state.connections.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<Published> {
        self.state.publishes.lock().unwrap().clone()
    }

    /// Wait until at least `count` messages were published.
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<Published> {
        wait_until(Duration::from_secs(5), || self.publishes().len() >= count).await;
        self.publishes()
    }
}

async fn serve(mut stream: TcpStream, state: Arc<BrokerState>) -> io::Result<()> {
    loop {
        let (header, body) = tokio::select! {
            packet = read_packet(&mut stream) => packet?,
            _ = state.kick.notified() => return Ok(()),
        };

        match header >> 4 {
            1 => {
                state.connects.fetch_add(1, Ordering::SeqCst);
                state.connections.lock().unwrap().push(parse_connect(&body));

                if state.silent.load(Ordering::SeqCst) {
                    continue;
                }
                if state.accept.load(Ordering::SeqCst) {
                    stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;
                } else {
                    stream
                        .write_all(&[0x20, 0x02, 0x00, REFUSED_NOT_AUTHORIZED])
                        .await?;
                    return Ok(());
                }
            }
            3 => {
                let published = parse_publish(header, &body);
                if let Some(pkid) = published.pkid {
                    let [hi, lo] = pkid.to_be_bytes();
                    stream.write_all(&[0x40, 0x02, hi, lo]).await?;
                }
                state.publishes.lock().unwrap().push(published);
            }
            12 => stream.write_all(&[0xD0, 0x00]).await?,
            14 => return Ok(()),
            _ => {}
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut length = 0usize;
    let mut multiplier = 1usize;
    loop {
        let byte = stream.read_u8().await?;
        length += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn read_u16(body: &[u8], pos: &mut usize) -> u16 {
    let value = u16::from_be_bytes([body[*pos], body[*pos + 1]]);
    *pos += 2;
    value
}

fn read_string(body: &[u8], pos: &mut usize) -> String {
    let len = usize::from(read_u16(body, pos));
    let value = String::from_utf8_lossy(&body[*pos..*pos + len]).into_owned();
    *pos += len;
    value
}

fn parse_connect(body: &[u8]) -> ConnectInfo {
    let mut pos = 0;
    let _protocol = read_string(body, &mut pos);
    let _level = body[pos];
    let flags = body[pos + 1];
    pos += 2;
    let keep_alive = read_u16(body, &mut pos);
    let client_id = read_string(body, &mut pos);

    if flags & 0x04 != 0 {
        let _will_topic = read_string(body, &mut pos);
        let _will_message = read_string(body, &mut pos);
    }
    let username = (flags & 0x80 != 0).then(|| read_string(body, &mut pos));

    ConnectInfo {
        client_id,
        username,
        keep_alive,
    }
}

fn parse_publish(header: u8, body: &[u8]) -> Published {
    let qos = (header >> 1) & 0x03;
    let mut pos = 0;
    let topic = read_string(body, &mut pos);
    let pkid = (qos > 0).then(|| read_u16(body, &mut pos));

    Published {
        topic,
        qos,
        pkid,
        payload: body[pos..].to_vec(),
    }
}

/// Poll `condition` every 10 ms until it holds; panics after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not met before timeout");
}

/// Await `future`, failing the test after `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation did not finish in time")
}

pub fn credentials() -> SessionCredentials {
    SessionCredentials {
        access_token: "A1B2C3D4".to_string(),
    }
}

/// Gateway configuration pointing at a local broker, with short timeouts.
pub fn gateway_config(broker: SocketAddr) -> GatewayConfig {
    let json = format!(
        r#"{{
            link: {{ ssid: "field-ap", passphrase: "secret", max_attempts: 2, retry_delay_ms: 100, timeout_ms: 2000, startup_rounds: 1 }},
            collector: {{
                host: "{}",
                port: {},
                access_token: "A1B2C3D4",
                max_attempts: 5,
                retry_delay_ms: 20,
                timeout_ms: 1000,
            }},
            cycle: {{ interval_secs: 1, health_check_every: 2 }},
            device: {{ firmware_version: "2.0.0" }},
        }}"#,
        broker.ip(),
        broker.port()
    );

    GatewayConfig::parse(&json).expect("Invalid test config")
}
