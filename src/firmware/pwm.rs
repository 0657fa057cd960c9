//! PWM backend seam for the servo controller.
//!
//! The real controller drives a PCA9685 over I²C; tests and bench rigs plug
//! in [`RecordingPwm`] instead. Retry-on-NACK and channel-disable policy
//! live above this trait in the controller, not in the backend.

use async_trait::async_trait;

/// A raw 16-channel PWM device. `pulse` is in raw PCA9685 units; 0 floats
/// the output (no holding torque).
#[async_trait]
pub trait PwmBackend: Send + Sync {
    /// Write one channel's pulse. Errors represent bus-level failures
    /// (I²C NACK, device absent).
    async fn set_pulse(&self, channel: u8, pulse: u16) -> Result<(), PwmWriteError>;
}

/// A failed register write, before any retry policy is applied.
#[derive(Debug, thiserror::Error)]
#[error("pwm write failed on channel {channel}: {reason}")]
pub struct PwmWriteError {
    pub channel: u8,
    pub reason: String,
}

/// Stand-in backend for rigs without a PCA9685 attached: writes are logged
/// at debug level and otherwise succeed.
#[derive(Debug, Default)]
pub struct DebugPwm;

#[async_trait]
impl PwmBackend for DebugPwm {
    async fn set_pulse(&self, channel: u8, pulse: u16) -> Result<(), PwmWriteError> {
        tracing::debug!(channel, pulse, "pwm write");
        Ok(())
    }
}

/// In-memory backend that records every write. Channels listed in
/// `failing` NACK forever, for exercising the retry/disable policy.
#[derive(Debug, Default)]
pub struct RecordingPwm {
    writes: std::sync::Mutex<Vec<(u8, u16)>>,
    failing: std::sync::Mutex<std::collections::HashSet<u8>>,
}

impl RecordingPwm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `channel` fail from now on.
    pub fn fail_channel(&self, channel: u8) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel);
    }

    /// Every `(channel, pulse)` written so far, in order.
    pub fn writes(&self) -> Vec<(u8, u16)> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The last pulse written to `channel`, if any.
    pub fn last_pulse(&self, channel: u8) -> Option<u16> {
        self.writes()
            .iter()
            .rev()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, pulse)| *pulse)
    }
}

#[async_trait]
impl PwmBackend for RecordingPwm {
    async fn set_pulse(&self, channel: u8, pulse: u16) -> Result<(), PwmWriteError> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&channel)
        {
            return Err(PwmWriteError {
                channel,
                reason: "i2c nack".to_owned(),
            });
        }
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((channel, pulse));
        Ok(())
    }
}
