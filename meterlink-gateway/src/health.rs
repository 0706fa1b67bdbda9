//! Gateway health tracking.
//!
//! Counters for acquisition and publishing plus the liveness of the meter.
//! A [`HealthSnapshot`] is logged on every periodic health check.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::link::LinkState;
use crate::session::SessionState;

/// Consecutive failed reads after which the meter is reported offline.
pub const OFFLINE_AFTER: u32 = 3;

/// Meter availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Last read succeeded.
    Online,
    /// Reads are failing, but fewer than [`OFFLINE_AFTER`] in a row.
    Degraded,
    Offline,
    /// Never polled.
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health snapshot for logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub uptime_secs: u64,
    pub cycles: u64,
    pub readings_ok: u64,
    pub readings_failed: u64,
    pub publishes_ok: u64,
    pub publishes_failed: u64,
    pub consecutive_failures: u32,
    pub device: DeviceStatus,
    /// Millis since epoch of the last valid reading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub link: LinkState,
    pub session: SessionState,
}

/// Health counters owned by the orchestrator.
#[derive(Debug)]
pub struct GatewayHealth {
    start_time: Instant,
    cycles: u64,
    readings_ok: u64,
    readings_failed: u64,
    publishes_ok: u64,
    publishes_failed: u64,
    consecutive_failures: u32,
    device: DeviceStatus,
    last_success: Option<i64>,
    last_error: Option<String>,
}

impl Default for GatewayHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: 0,
            readings_ok: 0,
            readings_failed: 0,
            publishes_ok: 0,
            publishes_failed: 0,
            consecutive_failures: 0,
            device: DeviceStatus::Unknown,
            last_success: None,
            last_error: None,
        }
    }

    pub fn record_cycle(&mut self) {
        self.cycles += 1;
    }

    pub fn record_read_success(&mut self) {
        self.readings_ok += 1;
        self.consecutive_failures = 0;
        self.device = DeviceStatus::Online;
        self.last_success = Some(chrono::Utc::now().timestamp_millis());
        self.last_error = None;
    }

    pub fn record_read_failure(&mut self, error: &str) {
        self.readings_failed += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());

        self.device = if self.consecutive_failures >= OFFLINE_AFTER {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Degraded
        };
    }

    pub fn record_publish(&mut self, ok: bool) {
        if ok {
            self.publishes_ok += 1;
        } else {
            self.publishes_failed += 1;
        }
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.device
    }

    /// Current counters together with the connectivity states.
    pub fn snapshot(&self, link: LinkState, session: SessionState) -> HealthSnapshot {
        HealthSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            cycles: self.cycles,
            readings_ok: self.readings_ok,
            readings_failed: self.readings_failed,
            publishes_ok: self.publishes_ok,
            publishes_failed: self.publishes_failed,
            consecutive_failures: self.consecutive_failures,
            device: self.device,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
            link,
            session,
        }
    }
}
