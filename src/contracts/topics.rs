//! The closed set of topic constants and the per-topic QoS/retention policy.
//!
//! Topics follow `<domain>/<action>`; system topics use the 3-level
//! `system/<class>/<service>` form. Services never hard-code topic strings;
//! they import these constants, so adding a topic means touching this module
//! and every exhaustive match over it.

// -- wake --
pub const WAKE_EVENT: &str = "wake/event";
pub const WAKE_MIC: &str = "wake/mic";

// -- stt --
pub const STT_PARTIAL: &str = "stt/partial";
pub const STT_FINAL: &str = "stt/final";
pub const STT_AUDIO_FFT: &str = "stt/audio_fft";

// -- llm --
pub const LLM_REQUEST: &str = "llm/request";
pub const LLM_RESPONSE: &str = "llm/response";
pub const LLM_CANCEL: &str = "llm/cancel";
pub const LLM_STREAM: &str = "llm/stream";
pub const LLM_TOOLS_REGISTRY: &str = "llm/tools/registry";
// The source fleet emits dotted sub-actions for tool calls and a slashed path
// for the registry. Both forms are kept verbatim; consumers match exactly.
pub const LLM_TOOL_CALL_REQUEST: &str = "llm/tool.call.request";
pub const LLM_TOOL_CALL_RESULT: &str = "llm/tool.call.result";

// -- tts --
pub const TTS_SAY: &str = "tts/say";
pub const TTS_STATUS: &str = "tts/status";
pub const TTS_CONTROL: &str = "tts/control";

// -- memory / character --
pub const MEMORY_QUERY: &str = "memory/query";
pub const MEMORY_RESULTS: &str = "memory/results";
pub const CHARACTER_CURRENT: &str = "system/character/current";
pub const CHARACTER_GET: &str = "system/character/get";
pub const CHARACTER_RESULT: &str = "system/character/result";

// -- movement --
pub const MOVEMENT_COMMAND: &str = "movement/command";
pub const MOVEMENT_FRAME: &str = "movement/frame";
pub const MOVEMENT_STATE: &str = "movement/state";
pub const MOVEMENT_TEST: &str = "movement/test";
pub const MOVEMENT_STOP: &str = "movement/stop";
pub const MOVEMENT_STATUS: &str = "movement/status";

// -- camera --
pub const CAMERA_CAPTURE: &str = "camera/capture";
pub const CAMERA_IMAGE: &str = "camera/image";
pub const CAMERA_FRAME: &str = "camera/frame";

// -- system --
const HEALTH_PREFIX: &str = "system/health/";
const KEEPALIVE_PREFIX: &str = "system/keepalive/";

/// Retained health topic for `service`.
pub fn health_topic(service: &str) -> String {
    format!("{HEALTH_PREFIX}{service}")
}

/// Non-retained keepalive topic for `service`.
pub fn keepalive_topic(service: &str) -> String {
    format!("{KEEPALIVE_PREFIX}{service}")
}

/// Wildcard filter for health aggregators.
pub const HEALTH_ALL: &str = "system/health/+";

/// Every fixed (non-parameterized) topic in the registry.
///
/// Property tests iterate this set to pin the QoS policy and the
/// topic → event-type mapping.
pub const ALL_TOPICS: &[&str] = &[
    WAKE_EVENT,
    WAKE_MIC,
    STT_PARTIAL,
    STT_FINAL,
    STT_AUDIO_FFT,
    LLM_REQUEST,
    LLM_RESPONSE,
    LLM_CANCEL,
    LLM_STREAM,
    LLM_TOOLS_REGISTRY,
    LLM_TOOL_CALL_REQUEST,
    LLM_TOOL_CALL_RESULT,
    TTS_SAY,
    TTS_STATUS,
    TTS_CONTROL,
    MEMORY_QUERY,
    MEMORY_RESULTS,
    CHARACTER_CURRENT,
    CHARACTER_GET,
    CHARACTER_RESULT,
    MOVEMENT_COMMAND,
    MOVEMENT_FRAME,
    MOVEMENT_STATE,
    MOVEMENT_TEST,
    MOVEMENT_STOP,
    MOVEMENT_STATUS,
    CAMERA_CAPTURE,
    CAMERA_IMAGE,
    CAMERA_FRAME,
];

/// Delivery quality-of-service, transport-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    /// Fire-and-forget (MQTT QoS 0).
    AtMostOnce,
    /// Broker-acknowledged (MQTT QoS 1).
    AtLeastOnce,
}

/// QoS + retention for one topic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub qos: Qos,
    pub retain: bool,
}

impl DeliveryPolicy {
    const RETAINED: Self = Self {
        qos: Qos::AtLeastOnce,
        retain: true,
    };
    const RELIABLE: Self = Self {
        qos: Qos::AtLeastOnce,
        retain: false,
    };
    const STREAM: Self = Self {
        qos: Qos::AtMostOnce,
        retain: false,
    };
}

/// The QoS/retention policy for a topic.
///
/// Streams, partials and status ticks are QoS 0; commands, requests and
/// responses are QoS 1; retained state (health, tool registry, character)
/// is QoS 1 + retain.
pub fn delivery_policy(topic: &str) -> DeliveryPolicy {
    if topic.starts_with(HEALTH_PREFIX) {
        return DeliveryPolicy::RETAINED;
    }
    if topic.starts_with(KEEPALIVE_PREFIX) {
        return DeliveryPolicy::STREAM;
    }
    match topic {
        LLM_TOOLS_REGISTRY | CHARACTER_CURRENT => DeliveryPolicy::RETAINED,
        LLM_STREAM | STT_PARTIAL | STT_AUDIO_FFT | TTS_STATUS | MOVEMENT_STATE
        | MOVEMENT_STATUS | CAMERA_FRAME => DeliveryPolicy::STREAM,
        _ => DeliveryPolicy::RELIABLE,
    }
}

/// The declared event type for a fixed topic, or `None` for topics outside
/// the registry (unknown subscriptions are never dispatched).
pub fn event_type_for(topic: &str) -> Option<&'static str> {
    if topic.starts_with(HEALTH_PREFIX) {
        return Some("health.status");
    }
    if topic.starts_with(KEEPALIVE_PREFIX) {
        return Some("system.keepalive");
    }
    let event = match topic {
        WAKE_EVENT => "wake.event",
        WAKE_MIC => "wake.mic",
        STT_PARTIAL => "stt.partial",
        STT_FINAL => "stt.final",
        STT_AUDIO_FFT => "stt.audio_fft",
        LLM_REQUEST => "llm.request",
        LLM_RESPONSE => "llm.response",
        LLM_CANCEL => "llm.cancel",
        LLM_STREAM => "llm.stream",
        LLM_TOOLS_REGISTRY => "llm.tools.registry",
        LLM_TOOL_CALL_REQUEST => "llm.tool.call.request",
        LLM_TOOL_CALL_RESULT => "llm.tool.call.result",
        TTS_SAY => "tts.say",
        TTS_STATUS => "tts.status",
        TTS_CONTROL => "tts.control",
        MEMORY_QUERY => "memory.query",
        MEMORY_RESULTS => "memory.results",
        CHARACTER_CURRENT => "character.current",
        CHARACTER_GET => "character.get",
        CHARACTER_RESULT => "character.result",
        MOVEMENT_COMMAND => "movement.command",
        MOVEMENT_FRAME => "movement.frame",
        MOVEMENT_STATE => "movement.state",
        MOVEMENT_TEST => "movement.test",
        MOVEMENT_STOP => "movement.stop",
        MOVEMENT_STATUS => "movement.status",
        CAMERA_CAPTURE => "camera.capture",
        CAMERA_IMAGE => "camera.image",
        CAMERA_FRAME => "camera.frame",
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_topic_has_an_event_type() {
        for topic in ALL_TOPICS {
            assert!(
                event_type_for(topic).is_some(),
                "no event type for {topic}"
            );
        }
    }

    #[test]
    fn event_types_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for topic in ALL_TOPICS {
            let event = event_type_for(topic).unwrap();
            assert!(seen.insert(event), "duplicate event type {event}");
        }
    }

    #[test]
    fn retained_topics() {
        for topic in [CHARACTER_CURRENT, LLM_TOOLS_REGISTRY, "system/health/stt"] {
            let policy = delivery_policy(topic);
            assert!(policy.retain, "{topic} must be retained");
            assert_eq!(policy.qos, Qos::AtLeastOnce);
        }
    }

    #[test]
    fn stream_topics_are_qos0_unretained() {
        for topic in [
            LLM_STREAM,
            STT_PARTIAL,
            STT_AUDIO_FFT,
            TTS_STATUS,
            MOVEMENT_STATE,
            MOVEMENT_STATUS,
            CAMERA_FRAME,
            "system/keepalive/stt",
        ] {
            let policy = delivery_policy(topic);
            assert_eq!(policy.qos, Qos::AtMostOnce, "{topic}");
            assert!(!policy.retain, "{topic}");
        }
    }

    #[test]
    fn commands_and_responses_are_qos1_unretained() {
        for topic in [
            WAKE_MIC,
            STT_FINAL,
            LLM_REQUEST,
            LLM_RESPONSE,
            LLM_CANCEL,
            TTS_SAY,
            TTS_CONTROL,
            MEMORY_QUERY,
            MEMORY_RESULTS,
            MOVEMENT_COMMAND,
            MOVEMENT_FRAME,
            MOVEMENT_STOP,
            CAMERA_CAPTURE,
            CAMERA_IMAGE,
        ] {
            let policy = delivery_policy(topic);
            assert_eq!(policy.qos, Qos::AtLeastOnce, "{topic}");
            assert!(!policy.retain, "{topic}");
        }
    }

    #[test]
    fn system_topic_helpers() {
        assert_eq!(health_topic("stt"), "system/health/stt");
        assert_eq!(keepalive_topic("stt"), "system/keepalive/stt");
        assert_eq!(event_type_for(&health_topic("router")), Some("health.status"));
        assert_eq!(
            event_type_for(&keepalive_topic("router")),
            Some("system.keepalive")
        );
    }

    #[test]
    fn unknown_topic_has_no_event_type() {
        assert_eq!(event_type_for("bogus/topic"), None);
    }
}
