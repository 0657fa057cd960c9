//! Wake-activation contracts: detection events and microphone arming.

use serde::{Deserialize, Serialize};

use super::{ContractError, EventPayload};

/// Closed set of wake detection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeKind {
    #[serde(rename = "wake.event")]
    Wake,
}

/// A wake-word detection published by the wake-activation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WakeEvent {
    #[serde(rename = "type")]
    pub kind: WakeKind,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    /// Detection engine name, when the producer reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl EventPayload for WakeEvent {
    const EVENT_TYPE: &'static str = "wake.event";

    fn validate(&self) -> Result<(), ContractError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ContractError::OutOfRange {
                field: "confidence",
                value: f64::from(self.confidence),
                range: "[0, 1]",
            });
        }
        Ok(())
    }
}

/// Microphone arming command issued by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicSwitch {
    Enable,
    Disable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MicCommand {
    pub command: MicSwitch,
}

impl EventPayload for MicCommand {
    const EVENT_TYPE: &'static str = "wake.mic";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_range_enforced() {
        let ev = WakeEvent {
            kind: WakeKind::Wake,
            confidence: 1.2,
            engine: None,
        };
        assert!(ev.validate().is_err());
        let ok = WakeEvent {
            kind: WakeKind::Wake,
            confidence: 0.9,
            engine: Some("porcupine".into()),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn wake_kind_wire_form() {
        let json = serde_json::to_string(&WakeKind::Wake).unwrap();
        assert_eq!(json, "\"wake.event\"");
    }

    #[test]
    fn mic_command_wire_form() {
        let cmd = MicCommand {
            command: MicSwitch::Enable,
        };
        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"command":"enable"}"#
        );
    }
}
