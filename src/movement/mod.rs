//! Movement pipeline, host side: directive → calibrated frame expansion,
//! preset library, execution with busy rejection and state publication.

pub mod calibration;
pub mod presets;
pub mod service;

pub use calibration::{ChannelCalibration, ServoCalibration};
pub use presets::{preset, PresetStep, PRESET_NAMES};
pub use service::{expand_directive, MovementService, ResolvedStep};

use crate::contracts::ContractError;

/// Host-side movement errors.
#[derive(Debug, thiserror::Error)]
pub enum MovementError {
    /// A directive arrived while another sequence is active.
    #[error("movement busy: {0:?} is still executing")]
    Busy(String),

    #[error("unknown preset {0:?}")]
    UnknownPreset(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("channel {channel}: pulse {pulse} outside calibrated [{min}, {max}]")]
    PulseOutOfRange {
        channel: u8,
        pulse: u16,
        min: u16,
        max: u16,
    },

    #[error(transparent)]
    Contract(#[from] ContractError),
}
