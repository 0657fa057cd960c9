//! Text-to-speech contracts: say commands, speaking status, playback control.

use serde::{Deserialize, Serialize};

use super::EventPayload;

/// Speak a line. The router emits at most one of these per `utt_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TtsSay {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl EventPayload for TtsSay {
    const EVENT_TYPE: &'static str = "tts.say";
}

/// Closed set of speaking transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsEvent {
    SpeakingStart,
    SpeakingEnd,
}

/// Speaking status tick from the TTS worker. `speaking_end` for the active
/// `utt_id` closes the conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TtsStatus {
    pub event: TtsEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
}

impl EventPayload for TtsStatus {
    const EVENT_TYPE: &'static str = "tts.status";
}

/// Closed set of playback control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsAction {
    Pause,
    Resume,
    Stop,
    Mute,
    Unmute,
}

/// Playback control command (barge-in stop, mute toggles).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TtsControl {
    pub action: TtsAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
}

impl EventPayload for TtsControl {
    const EVENT_TYPE: &'static str = "tts.control";
}
