//! TARS: a distributed voice-assistant robot platform built on an MQTT
//! event fabric.
//!
//! The value lives in the fabric, not any single worker:
//! - **Contracts**: every topic and message schema in one registry, with
//!   envelope semantics and validation at both ends
//! - **Shared client**: reconnect, health, heartbeat, dedup, and handler
//!   dispatch used identically by every service
//! - **Router**: the one stateful coordinator, driving
//!   wake → STT → LLM → TTS turns with correlation and cancellation
//! - **Movement**: calibrated directive → frame expansion on the host, and
//!   the servo-controller firmware with per-channel locks and a 100 ms
//!   emergency stop
//!
//! Speech recognition, synthesis, LLM inference, and retrieval are external
//! collaborators, specified only by the contracts they produce and consume.

pub mod config;
pub mod contracts;
pub mod error;
pub mod firmware;
pub mod movement;
pub mod mqtt;
pub mod router;
pub mod service;

pub use config::{BrokerUrl, FirmwareConfig, MovementConfig, MqttConfig, RouterConfig};
pub use error::{Result, TarsError};
pub use mqtt::{MqttClient, MqttError};
pub use router::RouterService;
