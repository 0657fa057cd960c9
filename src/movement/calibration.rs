//! Per-channel servo calibration: labels and safe pulse ranges in raw
//! PCA9685 units.
//!
//! Every commanded pulse is checked against the channel's `[min, max]`
//! before it goes anywhere near PWM; the defaults below are conservative
//! values for the TARS replica chassis and can be overridden (fully or per
//! channel) by a JSON file on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contracts::movement::{validate_channel, CHANNEL_COUNT, PULSE_SAFETY_MAX};
use crate::movement::MovementError;

/// Calibration for one servo channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChannelCalibration {
    pub label: String,
    pub min: u16,
    pub max: u16,
    pub neutral: u16,
}

impl ChannelCalibration {
    fn check(&self, channel: u8) -> Result<(), MovementError> {
        if self.min > self.neutral || self.neutral > self.max {
            return Err(MovementError::Calibration(format!(
                "channel {channel} ({}): min {} <= neutral {} <= max {} violated",
                self.label, self.min, self.neutral, self.max
            )));
        }
        if self.max > PULSE_SAFETY_MAX {
            return Err(MovementError::Calibration(format!(
                "channel {channel} ({}): max {} exceeds safety ceiling {PULSE_SAFETY_MAX}",
                self.label, self.max
            )));
        }
        Ok(())
    }
}

/// Partial per-channel override loaded from the calibration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelOverride {
    channel: u8,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    min: Option<u16>,
    #[serde(default)]
    max: Option<u16>,
    #[serde(default)]
    neutral: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalibrationFile {
    channels: Vec<ChannelOverride>,
}

/// Full nine-channel calibration table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServoCalibration {
    channels: Vec<ChannelCalibration>,
}

impl Default for ServoCalibration {
    fn default() -> Self {
        fn cal(label: &str, min: u16, neutral: u16, max: u16) -> ChannelCalibration {
            ChannelCalibration {
                label: label.to_owned(),
                min,
                max,
                neutral,
            }
        }
        Self {
            channels: vec![
                cal("center_lift", 180, 300, 420),
                cal("port_main", 200, 310, 440),
                cal("starboard_main", 200, 310, 440),
                cal("port_shoulder", 170, 290, 430),
                cal("port_elbow", 190, 300, 420),
                cal("port_hand", 210, 320, 450),
                cal("starboard_shoulder", 170, 290, 430),
                cal("starboard_elbow", 190, 300, 420),
                cal("starboard_hand", 210, 320, 450),
            ],
        }
    }
}

impl ServoCalibration {
    /// Defaults, with the JSON override applied when `path` is given.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable, malformed, or produces a table
    /// violating `min <= neutral <= max <= 600`.
    pub fn load(path: Option<&Path>) -> Result<Self, MovementError> {
        let mut calibration = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read(path).map_err(|e| {
                MovementError::Calibration(format!("read {}: {e}", path.display()))
            })?;
            let file: CalibrationFile = serde_json::from_slice(&raw).map_err(|e| {
                MovementError::Calibration(format!("parse {}: {e}", path.display()))
            })?;
            for entry in file.channels {
                validate_channel(entry.channel)?;
                let slot = &mut calibration.channels[entry.channel as usize];
                if let Some(label) = entry.label {
                    slot.label = label;
                }
                if let Some(min) = entry.min {
                    slot.min = min;
                }
                if let Some(max) = entry.max {
                    slot.max = max;
                }
                if let Some(neutral) = entry.neutral {
                    slot.neutral = neutral;
                }
            }
        }
        calibration.check()?;
        Ok(calibration)
    }

    fn check(&self) -> Result<(), MovementError> {
        for (channel, cal) in self.channels.iter().enumerate() {
            cal.check(channel as u8)?;
        }
        Ok(())
    }

    /// Calibration for one channel.
    pub fn channel(&self, channel: u8) -> Result<&ChannelCalibration, MovementError> {
        validate_channel(channel)?;
        Ok(&self.channels[channel as usize])
    }

    /// Is `pulse` inside the channel's calibrated range?
    pub fn validate_pulse(&self, channel: u8, pulse: u16) -> Result<(), MovementError> {
        let cal = self.channel(channel)?;
        if pulse < cal.min || pulse > cal.max {
            return Err(MovementError::PulseOutOfRange {
                channel,
                pulse,
                min: cal.min,
                max: cal.max,
            });
        }
        Ok(())
    }

    /// Map a logical `percent` (0 = min, 100 = max) onto the channel's raw
    /// pulse range.
    pub fn percent_to_pulse(&self, channel: u8, percent: f32) -> Result<u16, MovementError> {
        let cal = self.channel(channel)?;
        let clamped = percent.clamp(0.0, 100.0);
        let span = f32::from(cal.max - cal.min);
        let pulse = f32::from(cal.min) + span * clamped / 100.0;
        Ok(pulse.round() as u16)
    }

    /// The channel's neutral pulse.
    pub fn neutral(&self, channel: u8) -> Result<u16, MovementError> {
        Ok(self.channel(channel)?.neutral)
    }

    pub fn channel_count(&self) -> u8 {
        CHANNEL_COUNT
    }
}
