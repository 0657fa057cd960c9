//! Movement contracts: directives, expanded servo frames, state and status.
//!
//! This is the one boundary where the fleet tolerates envelope-less payloads:
//! the firmware accepts a bare `MovementFrame` as well as the enveloped form,
//! for compatibility with legacy frame producers.

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::{ContractError, EventPayload};

/// Servo channels are 0..=8 (nine servos).
pub const CHANNEL_COUNT: u8 = 9;
/// Raw PCA9685 pulse ceiling; calibrations never exceed this.
pub const PULSE_SAFETY_MAX: u16 = 600;
/// Movement speed bounds.
pub const SPEED_MIN: f32 = 0.1;
pub const SPEED_MAX: f32 = 1.0;

/// Validate a channel index.
pub fn validate_channel(channel: u8) -> Result<(), ContractError> {
    if channel >= CHANNEL_COUNT {
        return Err(ContractError::OutOfRange {
            field: "channel",
            value: f64::from(channel),
            range: "[0, 8]",
        });
    }
    Ok(())
}

/// Validate a speed factor.
pub fn validate_speed(speed: f32) -> Result<(), ContractError> {
    if !(SPEED_MIN..=SPEED_MAX).contains(&speed) {
        return Err(ContractError::OutOfRange {
            field: "speed",
            value: f64::from(speed),
            range: "[0.1, 1.0]",
        });
    }
    Ok(())
}

/// One logical target within a step: a channel and a percentage position
/// between the channel's calibrated `min` (0%) and `max` (100%).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChannelTarget {
    pub channel: u8,
    pub percent: f32,
}

/// One step of an inline custom sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementStepSpec {
    pub targets: Vec<ChannelTarget>,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default)]
    pub delay_after_s: f64,
}

fn default_speed() -> f32 {
    0.5
}

/// High-level movement command: a named preset from the built-in library, or
/// `name = "custom"` with an inline sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementDirective {
    pub name: String,
    /// Overrides every step's speed when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Inline sequence, required iff `name == "custom"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<MovementStepSpec>>,
}

impl EventPayload for MovementDirective {
    const EVENT_TYPE: &'static str = "movement.command";

    fn validate(&self) -> Result<(), ContractError> {
        if let Some(speed) = self.speed {
            validate_speed(speed)?;
        }
        if self.name == "custom" && self.sequence.as_ref().is_none_or(Vec::is_empty) {
            return Err(ContractError::Invalid(
                "custom directive without an inline sequence".to_owned(),
            ));
        }
        if let Some(steps) = &self.sequence {
            for step in steps {
                validate_speed(step.speed)?;
                if step.delay_after_s < 0.0 {
                    return Err(ContractError::OutOfRange {
                        field: "delay_after_s",
                        value: step.delay_after_s,
                        range: "[0, ..)",
                    });
                }
                for target in &step.targets {
                    validate_channel(target.channel)?;
                    if !(0.0..=100.0).contains(&target.percent) {
                        return Err(ContractError::OutOfRange {
                            field: "percent",
                            value: f64::from(target.percent),
                            range: "[0, 100]",
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A single PWM setpoint targeted at one channel, consumed by the firmware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementFrame {
    pub channel: u8,
    pub pulse: u16,
    pub duration_ms: u32,
    pub ts: f64,
}

impl MovementFrame {
    /// Parse a frame off the wire: enveloped first, bare as the legacy
    /// fallback. Only this topic tolerates the bare form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, ContractError> {
        if let Ok(env) = Envelope::<MovementFrame>::from_bytes(bytes) {
            return Ok(env.data);
        }
        serde_json::from_slice(bytes).map_err(|e| ContractError::Deserialize {
            reason: e.to_string(),
            preview: super::envelope::payload_preview(bytes),
        })
    }
}

impl EventPayload for MovementFrame {
    const EVENT_TYPE: &'static str = "movement.frame";

    fn validate(&self) -> Result<(), ContractError> {
        validate_channel(self.channel)?;
        if self.pulse > PULSE_SAFETY_MAX {
            return Err(ContractError::OutOfRange {
                field: "pulse",
                value: f64::from(self.pulse),
                range: "[0, 600]",
            });
        }
        Ok(())
    }
}

/// Movement-service execution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementPhase {
    Idle,
    Executing,
    CoolingDown,
}

/// Phase transition published by the movement service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementState {
    pub state: MovementPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl EventPayload for MovementState {
    const EVENT_TYPE: &'static str = "movement.state";
}

/// Emergency stop trigger. The canonical cross-layer fast path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementStop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload for MovementStop {
    const EVENT_TYPE: &'static str = "movement.stop";
}

/// Smoke-test trigger handled by the movement service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementTest {
    /// Limit the smoke sequence to one channel when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
}

impl EventPayload for MovementTest {
    const EVENT_TYPE: &'static str = "movement.test";

    fn validate(&self) -> Result<(), ContractError> {
        if let Some(channel) = self.channel {
            validate_channel(channel)?;
        }
        Ok(())
    }
}

/// Firmware status report: positions, disable flags, emergency state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MovementStatus {
    /// Last commanded pulse per channel, index = channel.
    pub positions: Vec<u16>,
    pub moving: bool,
    pub emergency: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_channels: Vec<u8>,
}

impl EventPayload for MovementStatus {
    const EVENT_TYPE: &'static str = "movement.status";
}
