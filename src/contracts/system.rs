//! System-plane contracts: retained health and optional keepalive.

use serde::{Deserialize, Serialize};

use super::EventPayload;

/// Closed set of health transitions a service reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthEvent {
    Ready,
    Reconnected,
    Shutdown,
}

/// Retained per-service health value on `system/health/<service>`.
///
/// Published on startup, reconnect, and before shutdown; the broker Last-Will
/// covers crashes (`ok:false` with an `err`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HealthStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<HealthEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl HealthStatus {
    pub fn ready() -> Self {
        Self {
            ok: true,
            event: Some(HealthEvent::Ready),
            err: None,
        }
    }

    pub fn reconnected() -> Self {
        Self {
            ok: true,
            event: Some(HealthEvent::Reconnected),
            err: None,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            ok: false,
            event: Some(HealthEvent::Shutdown),
            err: None,
        }
    }

    pub fn failed(err: impl Into<String>) -> Self {
        Self {
            ok: false,
            event: None,
            err: Some(err.into()),
        }
    }
}

impl EventPayload for HealthStatus {
    const EVENT_TYPE: &'static str = "health.status";
}

/// Non-retained heartbeat tick. Absence for 3× the cadence is read as
/// failure by consumers; nothing is enforced on the producer side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Keepalive {
    /// Monotonic beat counter since service start.
    pub seq: u64,
    /// Service uptime in seconds.
    pub uptime_s: f64,
}

impl EventPayload for Keepalive {
    const EVENT_TYPE: &'static str = "system.keepalive";
}
