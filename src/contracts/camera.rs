//! Camera contracts: capture request/response and the live frame stream.
//!
//! A `camera/image` echoes the capture's `message_id` through the envelope's
//! `correlate` field so requesters can pair them.

use serde::{Deserialize, Serialize};

use super::{ContractError, EventPayload};

/// One-shot capture request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CameraCapture {
    /// JPEG quality 1..=100, when the requester cares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl EventPayload for CameraCapture {
    const EVENT_TYPE: &'static str = "camera.capture";

    fn validate(&self) -> Result<(), ContractError> {
        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                return Err(ContractError::OutOfRange {
                    field: "quality",
                    value: f64::from(q),
                    range: "[1, 100]",
                });
            }
        }
        Ok(())
    }
}

/// Captured still, base64-encoded with declared format and dimensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CameraImage {
    /// Base64 (standard alphabet) image bytes.
    pub data: String,
    /// Container format, e.g. `jpeg`.
    pub format: String,
    pub width: u32,
    pub height: u32,
}

impl EventPayload for CameraImage {
    const EVENT_TYPE: &'static str = "camera.image";
}

/// One frame of the continuous low-priority preview stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CameraFrame {
    pub data: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Monotonic frame counter for consumer-side ordering.
    pub seq: u64,
}

impl EventPayload for CameraFrame {
    const EVENT_TYPE: &'static str = "camera.frame";
}
