//! Servo-controller firmware: single-threaded async runtime driving the
//! PCA9685, a bus bridge for frames and the emergency stop, and a minimal
//! socket-level HTTP surface for local UIs.

pub mod bridge;
pub mod heap;
pub mod http;
pub mod pwm;
pub mod servo;

pub use bridge::FirmwareBridge;
pub use heap::HeapMonitor;
pub use http::HttpSurface;
pub use pwm::{DebugPwm, PwmBackend, PwmWriteError, RecordingPwm};
pub use servo::{ChannelDisabled, ServoController};

use crate::contracts::ContractError;
use crate::movement::MovementError;

/// Firmware-side errors. None of these crash the controller; they are
/// reported to callers and over the bus.
#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    /// A preset is already running.
    #[error("another preset is running")]
    PresetBusy,

    #[error("unknown preset {0:?}")]
    UnknownPreset(String),

    /// The emergency stop preempted a motion in flight.
    #[error("movement interrupted by emergency stop")]
    Interrupted,

    #[error("channel {0} is disabled after repeated hardware errors")]
    ChannelDisabled(u8),

    #[error("hardware error on channel {channel}: {reason}")]
    Hardware { channel: u8, reason: String },

    /// Free heap below the safety floor; new movement commands refused.
    #[error("memory pressure, movement command refused")]
    MemoryPressure,

    #[error(transparent)]
    Movement(#[from] MovementError),

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl FirmwareError {
    /// HTTP status code for the local control surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PresetBusy => 409,
            Self::MemoryPressure => 503,
            Self::UnknownPreset(_) => 404,
            _ => 400,
        }
    }
}
