//! Shared MQTT client: connection lifecycle, envelope publishing,
//! subscription dispatch, deduplication, health and heartbeat.

mod client;
mod dedup;

pub use client::{handler, Handler, HandlerFuture, LinkState, MqttClient, MqttError};
pub use dedup::{dedup_key, DedupCache};
