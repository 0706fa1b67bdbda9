//! Modbus RTU water meter gateway.
//!
//! Polls a BOVE ultrasonic water meter over a half-duplex serial line and
//! forwards decoded readings to an MQTT collector (ThingsBoard device API)
//! over a wireless link.
//!
//! # Topics
//!
//! ```text
//! v1/devices/me/telemetry    every valid reading
//! v1/devices/me/attributes   once per collector session
//! ```
//!
//! # Layers
//!
//! - [`codec`] and [`register_map`] - frame building, validation and decoding
//! - [`serial`] and [`transaction`] - the serial channel and the timed exchange on it
//! - [`link`] and [`session`] - link and collector session establishment
//! - [`orchestrator`] - startup, the acquisition cycle and health checks

pub mod codec;
pub mod config;
pub mod health;
pub mod link;
pub mod mock;
pub mod orchestrator;
pub mod register_map;
pub mod retry;
pub mod serial;
pub mod session;
pub mod signal;
pub mod transaction;
