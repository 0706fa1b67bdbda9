//! Modbus RTU water meter gateway.
//!
//! Polls the meter on a serial port and publishes readings to an MQTT
//! collector over the wireless link.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meterlink_gateway::config::GatewayConfig;
use meterlink_gateway::link::{InterfaceLink, LinkManager, LinkNotifier};
use meterlink_gateway::mock::{MockChannel, SimulatedMeter, sample_reading};
use meterlink_gateway::orchestrator::Orchestrator;
use meterlink_gateway::serial::{self, SerialChannel};
use meterlink_gateway::session::TransportSession;
use meterlink_gateway::transaction::TransactionEngine;
use tracing::info;

/// Modbus RTU water meter to MQTT gateway.
#[derive(Parser, Debug)]
#[command(name = "meterlink-gateway")]
#[command(about = "Polls a Modbus RTU water meter and publishes readings over MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "meterlink.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.check {
        println!("Configuration {:?} is valid", args.config);
        return Ok(());
    }

    // Initialize logging
    let log_config = config.logging.with_level_override(args.log_level.as_deref());
    meterlink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting meterlink-gateway {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    if config.serial.simulate {
        info!("Polling a simulated meter");
        let (channel, peer) = MockChannel::pair(config.serial.default);
        let meter = SimulatedMeter::new(config.meter.unit_id, sample_reading());
        meter.spawn(peer);
        run(channel, config).await
    } else {
        let channel = serial::open(&config.serial.port, &config.serial.default)
            .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;
        info!(port = %config.serial.port, settings = %config.serial.default, "Serial port open");
        run(channel, config).await
    }
}

async fn run<C: SerialChannel>(channel: C, config: GatewayConfig) -> Result<()> {
    let engine = TransactionEngine::new(
        channel,
        config.meter.transaction_config(config.serial.protocol),
    )
    .context("Failed to read serial settings")?;

    let notifier = LinkNotifier::new();
    let driver = InterfaceLink::new(
        config.link.interface.clone(),
        config.link.connect_command.clone(),
        notifier.clone(),
    )
    .with_poll_interval(Duration::from_millis(config.link.poll_interval_ms))
    .with_probe(config.link.probe_address.clone());
    let link = LinkManager::new(driver, notifier, config.link.retry_policy());

    let session = TransportSession::new(config.collector.session_config());

    let mut gateway = Orchestrator::new(engine, link, session, config);
    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await;

    info!("Gateway stopped");
    Ok(())
}
