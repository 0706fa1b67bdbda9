//! Startup sequencing and the periodic acquisition cycle.
//!
//! The gateway never stops on errors: without a link it keeps polling the
//! meter locally, and the periodic health check re-establishes the link and
//! the collector session when they are down.

use std::time::Duration;

use meterlink_common::{
    AttributesMessage, RawTelemetryMessage, Reading, TelemetryMessage, encode,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, TelemetryValues};
use crate::health::GatewayHealth;
use crate::link::{LinkDriver, LinkManager};
use crate::serial::SerialChannel;
use crate::session::{self, TransportSession};
use crate::transaction::TransactionEngine;

/// Drives the gateway.
pub struct Orchestrator<C: SerialChannel, D: LinkDriver> {
    engine: TransactionEngine<C>,
    link: LinkManager<D>,
    session: TransportSession,
    config: GatewayConfig,
    health: GatewayHealth,
    cycle: u64,
    /// Set on every new collector session, cleared after one attempt.
    attributes_pending: bool,
    degraded: bool,
}

impl<C: SerialChannel, D: LinkDriver> Orchestrator<C, D> {
    pub fn new(
        engine: TransactionEngine<C>,
        link: LinkManager<D>,
        session: TransportSession,
        config: GatewayConfig,
    ) -> Self {
        Self {
            engine,
            link,
            session,
            config,
            health: GatewayHealth::new(),
            cycle: 0,
            attributes_pending: false,
            degraded: false,
        }
    }

    pub fn engine(&self) -> &TransactionEngine<C> {
        &self.engine
    }

    pub fn link(&self) -> &LinkManager<D> {
        &self.link
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn health(&self) -> &GatewayHealth {
        &self.health
    }

    /// Running on local acquisition only.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn attributes_pending(&self) -> bool {
        self.attributes_pending
    }

    /// Bring up the link and the collector session.
    ///
    /// A link that cannot be established leaves the gateway in degraded
    /// mode; the health check keeps trying.
    pub async fn startup(&mut self) {
        let delay = Duration::from_secs(self.config.cycle.startup_delay_secs);
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs(), "Waiting before startup");
            tokio::time::sleep(delay).await;
        }

        if !self.connect_link_rounds().await {
            self.degraded = true;
            warn!("Link unavailable, continuing with local acquisition only");
            return;
        }

        self.connect_session().await;
    }

    async fn connect_link_rounds(&mut self) -> bool {
        let credentials = self.config.link.credentials();
        let rounds = self.config.link.startup_rounds;
        let round_delay = Duration::from_millis(self.config.link.startup_round_delay_ms);

        for round in 1..=rounds {
            match self.link.connect(&credentials).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(round, rounds, error = %e, "Link startup round failed");
                }
            }
            if round < rounds {
                tokio::time::sleep(round_delay).await;
            }
        }
        false
    }

    async fn connect_session(&mut self) -> bool {
        let collector = &self.config.collector;
        let address = match session::resolve(&collector.host, collector.port).await {
            Ok(address) => address,
            Err(e) => {
                error!(host = %collector.host, error = %e, "Collector resolution failed");
                return false;
            }
        };

        match self.session.connect(address, &collector.credentials()).await {
            Ok(()) => {
                self.attributes_pending = true;
                true
            }
            Err(e) => {
                error!(%address, error = %e, "Collector session unavailable");
                false
            }
        }
    }

    /// Log health and re-establish whatever is down.
    pub async fn health_check(&mut self) {
        let snapshot = self.health.snapshot(self.link.state(), self.session.state());
        info!(
            uptime_secs = snapshot.uptime_secs,
            cycles = snapshot.cycles,
            readings_ok = snapshot.readings_ok,
            readings_failed = snapshot.readings_failed,
            publishes_ok = snapshot.publishes_ok,
            publishes_failed = snapshot.publishes_failed,
            device = %snapshot.device,
            link = %snapshot.link,
            session = %snapshot.session,
            "Health check"
        );

        if !self.link.is_connected() {
            info!("Health check: reconnecting link");
            match self.link.connect(&self.config.link.credentials()).await {
                Ok(()) => {
                    if self.degraded {
                        info!("Link restored, leaving local-only mode");
                    }
                    self.degraded = false;
                }
                Err(e) => {
                    warn!(error = %e, "Health check: link still unavailable");
                    return;
                }
            }
        }

        if !self.session.is_connected() {
            info!("Health check: reconnecting collector session");
            self.connect_session().await;
        }
    }

    /// One acquisition cycle. Never fails; problems are logged and counted.
    pub async fn run_cycle(&mut self) {
        self.cycle += 1;
        self.health.record_cycle();

        if self.cycle % self.config.cycle.health_check_every == 0 {
            self.health_check().await;
        }

        match self.engine.read_once().await {
            Ok(reading) => {
                self.health.record_read_success();
                log_reading(&reading);

                if self.session.is_connected() {
                    self.forward(&reading).await;
                } else {
                    debug!(session = %self.session.state(), "Collector offline, reading not forwarded");
                }
            }
            Err(e) => {
                self.health.record_read_failure(&e.to_string());
                warn!(
                    cycle = self.cycle,
                    device = %self.health.device_status(),
                    error = %e,
                    "No valid reading this cycle"
                );
            }
        }

        self.session.maintain().await;
    }

    async fn forward(&mut self, reading: &Reading) {
        if self.attributes_pending {
            self.attributes_pending = false;
            let attributes =
                AttributesMessage::new(&self.config.device.firmware_version, &self.config.device.model, reading);
            let topic = self.config.collector.attributes_topic.clone();
            self.publish(&topic, &attributes).await;
        }

        let topic = self.config.collector.telemetry_topic.clone();
        match self.config.collector.telemetry_values {
            TelemetryValues::Scaled => {
                self.publish(&topic, &TelemetryMessage::from(reading)).await
            }
            TelemetryValues::Raw => {
                self.publish(&topic, &RawTelemetryMessage::from(reading)).await
            }
        }
    }

    async fn publish<T: serde::Serialize>(&mut self, topic: &str, message: &T) {
        let payload = match encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic, error = %e, "Failed to encode message");
                self.health.record_publish(false);
                return;
            }
        };

        match self.session.publish(topic, payload, true).await {
            Ok(pkid) => {
                debug!(topic, pkid, "Message queued");
                self.health.record_publish(true);
            }
            Err(e) => {
                warn!(topic, error = %e, "Publish failed");
                self.health.record_publish(false);
            }
        }
    }

    /// Start up, then run cycles every `cycle.interval_secs` until `shutdown`
    /// resolves.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                return;
            }
            _ = self.startup() => {}
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.cycle.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = async {
                    ticker.tick().await;
                    self.run_cycle().await;
                } => {}
            }
        }

        info!(cycles = self.cycle, "Shutting down");
        self.session.disconnect().await;
    }
}

fn log_reading(reading: &Reading) {
    info!(
        flow_lph = reading.flow_rate(),
        forward_m3 = reading.forward_total(),
        reverse_m3 = reading.reverse_total(),
        pressure_mpa = reading.pressure(),
        temperature_c = reading.temperature(),
        status = %reading.status,
        condition = reading.status.describe(),
        serial = %reading.serial_label(),
        address = reading.device_address,
        baud = %reading.baud_rate,
        "Meter reading"
    );
}
