//! Error types for the TARS core.

use crate::contracts::ContractError;

/// Top-level error type for the event fabric and its services.
#[derive(Debug, thiserror::Error)]
pub enum TarsError {
    /// Payload failed its topic contract.
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    /// Broker transport or client-state error.
    #[error("mqtt error: {0}")]
    Mqtt(#[from] crate::mqtt::MqttError),

    /// Conversation router error.
    #[error("router error: {0}")]
    Router(String),

    /// Movement host-side error.
    #[error("movement error: {0}")]
    Movement(#[from] crate::movement::MovementError),

    /// Servo-controller firmware error.
    #[error("firmware error: {0}")]
    Firmware(#[from] crate::firmware::FirmwareError),

    /// Configuration error (missing or unparseable environment).
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TarsError>;
