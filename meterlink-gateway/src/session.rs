//! MQTT transport session towards the collector.
//!
//! The session is driven by the caller: every wait on the event loop is
//! bounded, and the event loop is only polled from `connect`, `publish`,
//! `maintain` and `disconnect`. A ConnAck seen by the event handler is the
//! only way into [`SessionState::Connected`].

use std::net::SocketAddr;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::retry::RetryPolicy;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 10;

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Failed to resolve collector address: {0}")]
    ResolutionFailure(String),

    #[error("Collector refused the session")]
    SessionRefused,

    #[error("Session handshake timed out")]
    SessionTimeout,

    #[error("Publish failed: {0}")]
    PublishFailure(String),
}

/// Session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl SessionState {
    /// Allowed edges of the session state graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Disconnected, SessionState::Connecting)
                | (SessionState::Connecting, SessionState::Connected)
                | (SessionState::Connecting, SessionState::Disconnected)
                | (SessionState::Connected, SessionState::Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Device credentials: the access token is sent as the MQTT username.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub access_token: String,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_token", &"***")
            .finish()
    }
}

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Client ids are `<prefix>_<8 hex digits>`.
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    /// Limit for both incoming and outgoing packets.
    pub max_packet_size: usize,
    /// Handshake attempts, backoff and per-attempt timeout.
    pub handshake: RetryPolicy,
    pub publish_timeout: Duration,
    /// Idle time after which `maintain` stops draining.
    pub maintain_window: Duration,
    /// Upper bound of events handled per `maintain` call.
    pub maintain_max_events: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "bove_meter".to_string(),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 1024,
            handshake: RetryPolicy::new(5, 2000, 5000),
            publish_timeout: Duration::from_secs(5),
            maintain_window: Duration::from_millis(100),
            maintain_max_events: 32,
        }
    }
}

struct Connection {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
}

/// Resolve the collector, preferring an IPv4 address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    let addresses = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SessionError::ResolutionFailure(format!("{}: {}", host, e)))?;

    let address = pick_address(addresses)
        .ok_or_else(|| SessionError::ResolutionFailure(format!("{}: no addresses", host)))?;
    debug!(host, %address, "Collector resolved");
    Ok(address)
}

fn pick_address(addresses: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut fallback = None;
    for address in addresses {
        if address.is_ipv4() {
            return Some(address);
        }
        fallback.get_or_insert(address);
    }
    fallback
}

/// Random client id for one handshake attempt.
pub fn client_id(prefix: &str) -> String {
    format!("{}_{:08x}", prefix, rand::random::<u32>())
}

fn set_state(state: &watch::Sender<SessionState>, next: SessionState) {
    let current = *state.borrow();
    if current == next {
        return;
    }
    if !current.can_transition_to(next) {
        warn!(from = %current, to = %next, "Ignoring invalid session transition");
        return;
    }
    trace!(from = %current, to = %next, "Session state");
    state.send_replace(next);
}

fn handle_event(state: &watch::Sender<SessionState>, event: &Event) {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            if ack.code == ConnectReturnCode::Success {
                set_state(state, SessionState::Connected);
            } else {
                warn!(code = ?ack.code, "Collector rejected the session");
            }
        }
        Event::Incoming(Packet::Disconnect) => {
            warn!("Collector closed the session");
            set_state(state, SessionState::Disconnected);
        }
        Event::Incoming(Packet::PubAck(ack)) => {
            debug!(pkid = ack.pkid, "Publish acknowledged");
        }
        Event::Incoming(Packet::PingResp) | Event::Outgoing(Outgoing::PingReq) => {
            trace!(?event, "Keepalive");
        }
        other => trace!(event = ?other, "Session event"),
    }
}

/// MQTT session with bounded-retry establishment.
pub struct TransportSession {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    connection: Option<Connection>,
}

impl TransportSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            state,
            connection: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Client id of the established session.
    pub fn client_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.client_id.as_str())
    }

    /// Establish a session with up to `handshake.max_attempts` attempts.
    pub async fn connect(
        &mut self,
        address: SocketAddr,
        credentials: &SessionCredentials,
    ) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }
        let policy = self.config.handshake;

        for attempt in policy.attempts() {
            set_state(&self.state, SessionState::Connecting);
            let client_id = client_id(&self.config.client_id_prefix);
            info!(
                %address,
                client_id = %client_id,
                attempt,
                max_attempts = policy.max_attempts,
                "Connecting to collector"
            );

            match self.handshake(address, credentials, client_id).await {
                Ok(connection) => {
                    info!(%address, client_id = %connection.client_id, "Collector session established");
                    self.connection = Some(connection);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Collector handshake failed");
                    set_state(&self.state, SessionState::Disconnected);
                }
            }

            if !policy.is_last(attempt) {
                tokio::time::sleep(policy.delay()).await;
            }
        }

        set_state(&self.state, SessionState::Disconnected);
        Err(SessionError::SessionRefused)
    }

    async fn handshake(
        &self,
        address: SocketAddr,
        credentials: &SessionCredentials,
        client_id: String,
    ) -> Result<Connection, SessionError> {
        let mut options = MqttOptions::new(client_id.clone(), address.ip().to_string(), address.port());
        options
            .set_keep_alive(self.config.keep_alive)
            .set_credentials(credentials.access_token.clone(), "")
            .set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size)
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let deadline = Instant::now() + self.config.handshake.timeout();

        let outcome = loop {
            match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                Err(_) => break Err(SessionError::SessionTimeout),
                Ok(Ok(event)) => {
                    handle_event(&self.state, &event);
                    if self.is_connected() {
                        break Ok(());
                    }
                }
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    debug!(?code, "Handshake refused");
                    break Err(SessionError::SessionRefused);
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Handshake transport error");
                    break Err(SessionError::SessionRefused);
                }
            }
        };

        match outcome {
            Ok(()) => Ok(Connection {
                client,
                eventloop,
                client_id,
            }),
            Err(e) => {
                // Nothing polls the event loop again; dropping it closes the socket.
                if let Err(cleanup) = client.try_disconnect() {
                    debug!(client_id = %client_id, error = %cleanup, "Partial session cleanup not queued");
                }
                Err(e)
            }
        }
    }

    /// Queue a message and drive the transport until it is handed a packet id.
    ///
    /// Returns the packet id (0 for at-most-once messages).
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        at_least_once: bool,
    ) -> Result<u16, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::PublishFailure(format!(
                "session {}",
                self.state()
            )));
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(SessionError::PublishFailure("no connection".to_string()));
        };

        let qos = if at_least_once {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        let size = payload.len();
        connection
            .client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| SessionError::PublishFailure(e.to_string()))?;

        let deadline = Instant::now() + self.config.publish_timeout;
        let result = loop {
            match tokio::time::timeout_at(deadline, connection.eventloop.poll()).await {
                Err(_) => {
                    break Err(SessionError::PublishFailure(
                        "timed out waiting for the transport".to_string(),
                    ));
                }
                Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => break Ok(pkid),
                Ok(Ok(event)) => {
                    handle_event(&self.state, &event);
                    if *self.state.borrow() != SessionState::Connected {
                        break Err(SessionError::PublishFailure("session closed".to_string()));
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Collector connection lost");
                    set_state(&self.state, SessionState::Disconnected);
                    break Err(SessionError::PublishFailure(e.to_string()));
                }
            }
        };

        match &result {
            Ok(pkid) => debug!(topic, pkid, size, "Published"),
            Err(_) if !self.is_connected() => self.connection = None,
            Err(_) => {}
        }
        result
    }

    /// Drain inbound traffic and let the transport send a keepalive when due.
    ///
    /// Returns after the line has been idle for `maintain_window` or after
    /// `maintain_max_events` events. No-op unless connected.
    pub async fn maintain(&mut self) {
        if !self.is_connected() {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        for _ in 0..self.config.maintain_max_events {
            match tokio::time::timeout(self.config.maintain_window, connection.eventloop.poll())
                .await
            {
                Err(_) => break,
                Ok(Ok(event)) => {
                    handle_event(&self.state, &event);
                    if *self.state.borrow() != SessionState::Connected {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Collector connection lost");
                    set_state(&self.state, SessionState::Disconnected);
                    break;
                }
            }
        }

        if !self.is_connected() {
            self.connection = None;
        }
    }

    /// Close the session locally.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if connection.client.try_disconnect().is_ok() {
                let deadline = Instant::now() + self.config.maintain_window;
                while let Ok(Ok(event)) =
                    tokio::time::timeout_at(deadline, connection.eventloop.poll()).await
                {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            }
            info!(client_id = %connection.client_id, "Collector session closed");
        }
        set_state(&self.state, SessionState::Disconnected);
    }
}
