//! The authoritative topic and message-schema registry.
//!
//! Every topic constant, every payload type, and the validate / serialize /
//! deserialize path for each lives here. Services publish and consume only
//! through this module; a payload that fails validation never reaches a
//! handler.

pub mod camera;
pub mod envelope;
pub mod llm;
pub mod memory;
pub mod movement;
pub mod stt;
pub mod system;
pub mod topics;
pub mod tts;
pub mod wake;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use envelope::{Correlation, Envelope};
pub use topics::{delivery_policy, event_type_for, DeliveryPolicy, Qos};

/// Contract-layer failure: the message is dropped and logged, the handler is
/// never invoked.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("deserialize failed: {reason} (payload: {preview})")]
    Deserialize { reason: String, preview: String },

    #[error("{field} = {value} outside {range}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        range: &'static str,
    },

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("envelope type {actual:?} does not match {expected:?} declared for topic {topic}")]
    TypeMismatch {
        topic: String,
        expected: &'static str,
        actual: String,
    },

    #[error("topic {0:?} is not in the registry")]
    UnknownTopic(String),
}

/// A payload publishable on exactly one topic of the registry.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Fully-qualified event name this payload travels as.
    const EVENT_TYPE: &'static str;

    /// Range/semantic checks beyond what serde enforces.
    fn validate(&self) -> Result<(), ContractError> {
        Ok(())
    }
}

/// Every inbound event the fleet understands, tagged per topic.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    WakeEvent(wake::WakeEvent),
    MicCommand(wake::MicCommand),
    SttPartial(stt::SttPartial),
    SttFinal(stt::SttFinal),
    AudioFft(stt::AudioFft),
    LlmRequest(llm::LlmRequest),
    LlmResponse(llm::LlmResponse),
    LlmCancel(llm::LlmCancel),
    LlmStream(llm::LlmStreamDelta),
    ToolRegistry(llm::ToolRegistry),
    ToolCallRequest(llm::ToolCallRequest),
    ToolCallResult(llm::ToolCallResult),
    TtsSay(tts::TtsSay),
    TtsStatus(tts::TtsStatus),
    TtsControl(tts::TtsControl),
    MemoryQuery(memory::MemoryQuery),
    MemoryResults(memory::MemoryResults),
    CharacterCurrent(memory::CharacterCurrent),
    CharacterGet(memory::CharacterGet),
    CharacterResult(memory::CharacterResult),
    MovementCommand(movement::MovementDirective),
    MovementFrame(movement::MovementFrame),
    MovementState(movement::MovementState),
    MovementTest(movement::MovementTest),
    MovementStop(movement::MovementStop),
    MovementStatus(movement::MovementStatus),
    CameraCapture(camera::CameraCapture),
    CameraImage(camera::CameraImage),
    CameraFrame(camera::CameraFrame),
    Health(system::HealthStatus),
    Keepalive(system::Keepalive),
}

impl DomainEvent {
    /// The per-payload sequence number, for dedup keys and ordering checks.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::LlmStream(d) => Some(d.seq),
            Self::CameraFrame(f) => Some(f.seq),
            Self::Keepalive(k) => Some(k.seq),
            _ => None,
        }
    }
}

/// A validated inbound message: envelope metadata plus the typed payload.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub message_id: String,
    pub event_type: String,
    pub ts: f64,
    pub source: String,
    pub correlation: Correlation,
    pub event: DomainEvent,
}

fn parse<T>(
    topic: &str,
    bytes: &[u8],
    wrap: fn(T) -> DomainEvent,
) -> Result<Inbound, ContractError>
where
    T: EventPayload,
{
    let env: Envelope<T> = Envelope::from_bytes(bytes)?;
    if env.event_type != T::EVENT_TYPE {
        return Err(ContractError::TypeMismatch {
            topic: topic.to_owned(),
            expected: T::EVENT_TYPE,
            actual: env.event_type,
        });
    }
    env.data.validate()?;
    Ok(Inbound {
        topic: topic.to_owned(),
        message_id: env.message_id,
        event_type: env.event_type,
        ts: env.ts,
        source: env.source,
        correlation: Correlation {
            correlate: env.correlate,
            utt_id: env.utt_id,
        },
        event: wrap(env.data),
    })
}

/// Validate `bytes` against `topic`'s contract and return the typed event.
///
/// Unknown topics error out like an unknown subscription: the caller drops
/// the message without invoking any handler.
pub fn decode_event(topic: &str, bytes: &[u8]) -> Result<Inbound, ContractError> {
    use topics::*;

    if topic.starts_with("system/health/") {
        return parse::<system::HealthStatus>(topic, bytes, DomainEvent::Health);
    }
    if topic.starts_with("system/keepalive/") {
        return parse::<system::Keepalive>(topic, bytes, DomainEvent::Keepalive);
    }
    match topic {
        WAKE_EVENT => parse::<wake::WakeEvent>(topic, bytes, DomainEvent::WakeEvent),
        WAKE_MIC => parse::<wake::MicCommand>(topic, bytes, DomainEvent::MicCommand),
        STT_PARTIAL => parse::<stt::SttPartial>(topic, bytes, DomainEvent::SttPartial),
        STT_FINAL => parse::<stt::SttFinal>(topic, bytes, DomainEvent::SttFinal),
        STT_AUDIO_FFT => parse::<stt::AudioFft>(topic, bytes, DomainEvent::AudioFft),
        LLM_REQUEST => parse::<llm::LlmRequest>(topic, bytes, DomainEvent::LlmRequest),
        LLM_RESPONSE => parse::<llm::LlmResponse>(topic, bytes, DomainEvent::LlmResponse),
        LLM_CANCEL => parse::<llm::LlmCancel>(topic, bytes, DomainEvent::LlmCancel),
        LLM_STREAM => parse::<llm::LlmStreamDelta>(topic, bytes, DomainEvent::LlmStream),
        LLM_TOOLS_REGISTRY => parse::<llm::ToolRegistry>(topic, bytes, DomainEvent::ToolRegistry),
        LLM_TOOL_CALL_REQUEST => {
            parse::<llm::ToolCallRequest>(topic, bytes, DomainEvent::ToolCallRequest)
        }
        LLM_TOOL_CALL_RESULT => {
            parse::<llm::ToolCallResult>(topic, bytes, DomainEvent::ToolCallResult)
        }
        TTS_SAY => parse::<tts::TtsSay>(topic, bytes, DomainEvent::TtsSay),
        TTS_STATUS => parse::<tts::TtsStatus>(topic, bytes, DomainEvent::TtsStatus),
        TTS_CONTROL => parse::<tts::TtsControl>(topic, bytes, DomainEvent::TtsControl),
        MEMORY_QUERY => parse::<memory::MemoryQuery>(topic, bytes, DomainEvent::MemoryQuery),
        MEMORY_RESULTS => parse::<memory::MemoryResults>(topic, bytes, DomainEvent::MemoryResults),
        CHARACTER_CURRENT => {
            parse::<memory::CharacterCurrent>(topic, bytes, DomainEvent::CharacterCurrent)
        }
        CHARACTER_GET => parse::<memory::CharacterGet>(topic, bytes, DomainEvent::CharacterGet),
        CHARACTER_RESULT => {
            parse::<memory::CharacterResult>(topic, bytes, DomainEvent::CharacterResult)
        }
        MOVEMENT_COMMAND => {
            parse::<movement::MovementDirective>(topic, bytes, DomainEvent::MovementCommand)
        }
        MOVEMENT_FRAME => parse_movement_frame(bytes),
        MOVEMENT_STATE => parse::<movement::MovementState>(topic, bytes, DomainEvent::MovementState),
        MOVEMENT_TEST => parse::<movement::MovementTest>(topic, bytes, DomainEvent::MovementTest),
        MOVEMENT_STOP => parse::<movement::MovementStop>(topic, bytes, DomainEvent::MovementStop),
        MOVEMENT_STATUS => {
            parse::<movement::MovementStatus>(topic, bytes, DomainEvent::MovementStatus)
        }
        CAMERA_CAPTURE => parse::<camera::CameraCapture>(topic, bytes, DomainEvent::CameraCapture),
        CAMERA_IMAGE => parse::<camera::CameraImage>(topic, bytes, DomainEvent::CameraImage),
        CAMERA_FRAME => parse::<camera::CameraFrame>(topic, bytes, DomainEvent::CameraFrame),
        other => Err(ContractError::UnknownTopic(other.to_owned())),
    }
}

/// `movement/frame` is the one topic where the fleet tolerates bare
/// payloads: legacy frame producers publish without an envelope and the
/// firmware must still act on them.
fn parse_movement_frame(bytes: &[u8]) -> Result<Inbound, ContractError> {
    use movement::MovementFrame;

    if let Ok(env) = Envelope::<MovementFrame>::from_bytes(bytes) {
        if env.event_type != MovementFrame::EVENT_TYPE {
            return Err(ContractError::TypeMismatch {
                topic: topics::MOVEMENT_FRAME.to_owned(),
                expected: MovementFrame::EVENT_TYPE,
                actual: env.event_type,
            });
        }
        env.data.validate()?;
        return Ok(Inbound {
            topic: topics::MOVEMENT_FRAME.to_owned(),
            message_id: env.message_id,
            event_type: env.event_type,
            ts: env.ts,
            source: env.source,
            correlation: Correlation {
                correlate: env.correlate,
                utt_id: env.utt_id,
            },
            event: DomainEvent::MovementFrame(env.data),
        });
    }

    let frame: MovementFrame =
        serde_json::from_slice(bytes).map_err(|e| ContractError::Deserialize {
            reason: e.to_string(),
            preview: envelope::payload_preview(bytes),
        })?;
    frame.validate()?;
    Ok(Inbound {
        topic: topics::MOVEMENT_FRAME.to_owned(),
        message_id: uuid::Uuid::new_v4().simple().to_string(),
        event_type: MovementFrame::EVENT_TYPE.to_owned(),
        ts: frame.ts,
        source: "legacy".to_owned(),
        correlation: Correlation::none(),
        event: DomainEvent::MovementFrame(frame),
    })
}

/// Validate `data` and wrap it in a fresh envelope bound to `topic`.
///
/// Fails when the payload type does not belong to the topic; the closed
/// registry is enforced at publish time too.
pub fn encode_event<T: EventPayload>(
    topic: &str,
    source: &str,
    correlation: Correlation,
    data: T,
) -> Result<Envelope<T>, ContractError> {
    let declared = event_type_for(topic).ok_or_else(|| ContractError::UnknownTopic(topic.to_owned()))?;
    if declared != T::EVENT_TYPE {
        return Err(ContractError::TypeMismatch {
            topic: topic.to_owned(),
            expected: T::EVENT_TYPE,
            actual: declared.to_owned(),
        });
    }
    data.validate()?;
    Ok(Envelope::new(T::EVENT_TYPE, source, correlation, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A conformant sample envelope for every fixed topic in the registry.
    fn sample_bytes(topic: &str) -> Vec<u8> {
        use topics::*;

        fn enc<T: EventPayload>(topic: &str, data: T) -> Vec<u8> {
            encode_event(topic, "test", Correlation::none(), data)
                .unwrap()
                .to_bytes()
                .unwrap()
        }

        match topic {
            WAKE_EVENT => enc(
                topic,
                wake::WakeEvent {
                    kind: wake::WakeKind::Wake,
                    confidence: 0.9,
                    engine: None,
                },
            ),
            WAKE_MIC => enc(
                topic,
                wake::MicCommand {
                    command: wake::MicSwitch::Enable,
                },
            ),
            STT_PARTIAL => enc(
                topic,
                stt::SttPartial {
                    text: "what ti".into(),
                    utt_id: "u1".into(),
                },
            ),
            STT_FINAL => enc(
                topic,
                stt::SttFinal {
                    text: "what time is it".into(),
                    utt_id: "u1".into(),
                    confidence: Some(0.95),
                    lang: None,
                },
            ),
            STT_AUDIO_FFT => enc(topic, stt::AudioFft::from_magnitudes(&[0.1, 0.2], 16_000)),
            LLM_REQUEST => enc(
                topic,
                llm::LlmRequest {
                    id: "r1".into(),
                    utt_id: Some("u1".into()),
                    text: "what time is it".into(),
                    context: Vec::new(),
                    character: None,
                    temperature: Some(0.7),
                    stream: true,
                    tool_results: Vec::new(),
                },
            ),
            LLM_RESPONSE => enc(
                topic,
                llm::LlmResponse {
                    id: "r1".into(),
                    utt_id: Some("u1".into()),
                    reply: Some("it is noon".into()),
                    error: None,
                },
            ),
            LLM_CANCEL => enc(
                topic,
                llm::LlmCancel {
                    id: "r1".into(),
                    reason: None,
                },
            ),
            LLM_STREAM => enc(
                topic,
                llm::LlmStreamDelta {
                    id: "r1".into(),
                    utt_id: None,
                    seq: 0,
                    delta: "it ".into(),
                    done: false,
                },
            ),
            LLM_TOOLS_REGISTRY => enc(topic, llm::ToolRegistry { tools: Vec::new() }),
            LLM_TOOL_CALL_REQUEST => enc(
                topic,
                llm::ToolCallRequest {
                    call_id: "c1".into(),
                    id: "r1".into(),
                    name: "clock".into(),
                    arguments: serde_json::json!({}),
                },
            ),
            LLM_TOOL_CALL_RESULT => enc(
                topic,
                llm::ToolCallResult {
                    call_id: "c1".into(),
                    content: serde_json::json!("12:00"),
                    error: None,
                },
            ),
            TTS_SAY => enc(
                topic,
                tts::TtsSay {
                    text: "it is noon".into(),
                    utt_id: Some("u1".into()),
                    voice: None,
                },
            ),
            TTS_STATUS => enc(
                topic,
                tts::TtsStatus {
                    event: tts::TtsEvent::SpeakingStart,
                    utt_id: Some("u1".into()),
                },
            ),
            TTS_CONTROL => enc(
                topic,
                tts::TtsControl {
                    action: tts::TtsAction::Stop,
                    utt_id: Some("u1".into()),
                },
            ),
            MEMORY_QUERY => enc(
                topic,
                memory::MemoryQuery {
                    text: "coffee".into(),
                    utt_id: Some("u1".into()),
                    top_k: 5,
                },
            ),
            MEMORY_RESULTS => enc(
                topic,
                memory::MemoryResults {
                    utt_id: Some("u1".into()),
                    items: Vec::new(),
                },
            ),
            CHARACTER_CURRENT => enc(
                topic,
                memory::CharacterCurrent {
                    name: "tars".into(),
                    persona: None,
                    voice: None,
                },
            ),
            CHARACTER_GET => enc(topic, memory::CharacterGet::default()),
            CHARACTER_RESULT => enc(
                topic,
                memory::CharacterResult {
                    name: "tars".into(),
                    persona: None,
                },
            ),
            MOVEMENT_COMMAND => enc(
                topic,
                movement::MovementDirective {
                    name: "step_forward".into(),
                    speed: None,
                    sequence: None,
                },
            ),
            MOVEMENT_FRAME => enc(
                topic,
                movement::MovementFrame {
                    channel: 0,
                    pulse: 300,
                    duration_ms: 20,
                    ts: 0.0,
                },
            ),
            MOVEMENT_STATE => enc(
                topic,
                movement::MovementState {
                    state: movement::MovementPhase::Idle,
                    directive: None,
                    failure: None,
                },
            ),
            MOVEMENT_TEST => enc(topic, movement::MovementTest::default()),
            MOVEMENT_STOP => enc(topic, movement::MovementStop::default()),
            MOVEMENT_STATUS => enc(
                topic,
                movement::MovementStatus {
                    positions: vec![0; 9],
                    moving: false,
                    emergency: false,
                    disabled_channels: Vec::new(),
                },
            ),
            CAMERA_CAPTURE => enc(topic, camera::CameraCapture { quality: Some(85) }),
            CAMERA_IMAGE => enc(
                topic,
                camera::CameraImage {
                    data: String::new(),
                    format: "jpeg".into(),
                    width: 640,
                    height: 480,
                },
            ),
            CAMERA_FRAME => enc(
                topic,
                camera::CameraFrame {
                    data: String::new(),
                    format: "jpeg".into(),
                    width: 320,
                    height: 240,
                    seq: 1,
                },
            ),
            other => panic!("no sample for {other}"),
        }
    }

    #[test]
    fn every_topic_decodes_its_own_sample() {
        for topic in topics::ALL_TOPICS {
            let bytes = sample_bytes(topic);
            let inbound = decode_event(topic, &bytes)
                .unwrap_or_else(|e| panic!("decode failed for {topic}: {e}"));
            assert_eq!(
                inbound.event_type,
                event_type_for(topic).unwrap(),
                "event type mismatch on {topic}"
            );
        }
    }

    #[test]
    fn health_and_keepalive_decode() {
        let health = encode_event(
            "system/health/stt",
            "stt-worker",
            Correlation::none(),
            system::HealthStatus::ready(),
        )
        .unwrap()
        .to_bytes()
        .unwrap();
        let inbound = decode_event("system/health/stt", &health).unwrap();
        assert!(matches!(inbound.event, DomainEvent::Health(h) if h.ok));

        let beat = encode_event(
            "system/keepalive/stt",
            "stt-worker",
            Correlation::none(),
            system::Keepalive {
                seq: 3,
                uptime_s: 15.0,
            },
        )
        .unwrap()
        .to_bytes()
        .unwrap();
        let inbound = decode_event("system/keepalive/stt", &beat).unwrap();
        assert_eq!(inbound.event.seq(), Some(3));
    }

    #[test]
    fn encode_rejects_foreign_topic() {
        let err = encode_event(
            topics::TTS_SAY,
            "test",
            Correlation::none(),
            wake::MicCommand {
                command: wake::MicSwitch::Enable,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::TypeMismatch { .. }));
    }

    #[test]
    fn decode_rejects_mismatched_event_type() {
        // A tts.say envelope delivered on stt/final must not dispatch.
        let env = encode_event(
            topics::TTS_SAY,
            "test",
            Correlation::none(),
            tts::TtsSay {
                text: "hi".into(),
                utt_id: None,
                voice: None,
            },
        )
        .unwrap();
        let bytes = env.to_bytes().unwrap();
        assert!(decode_event(topics::STT_FINAL, &bytes).is_err());
    }

    #[test]
    fn bare_movement_frame_is_tolerated() {
        let bytes =
            serde_json::to_vec(&serde_json::json!({
                "channel": 2, "pulse": 310, "duration_ms": 40, "ts": 99.5,
            }))
            .unwrap();
        let inbound = decode_event(topics::MOVEMENT_FRAME, &bytes).unwrap();
        assert_eq!(inbound.source, "legacy");
        assert!((inbound.ts - 99.5).abs() < f64::EPSILON);
        assert!(matches!(
            inbound.event,
            DomainEvent::MovementFrame(f) if f.pulse == 310
        ));
        // The tolerance is frame-only: a bare payload elsewhere still fails.
        let bare_say = serde_json::to_vec(&serde_json::json!({"text": "hi"})).unwrap();
        assert!(decode_event(topics::TTS_SAY, &bare_say).is_err());
    }

    #[test]
    fn decode_rejects_unknown_topic() {
        let err = decode_event("no/such", b"{}").unwrap_err();
        assert!(matches!(err, ContractError::UnknownTopic(_)));
    }

    #[test]
    fn decode_rejects_out_of_range_payload() {
        let raw = serde_json::json!({
            "message_id": "m1",
            "type": "llm.request",
            "ts": 1.0,
            "source": "test",
            "data": {"id": "r1", "text": "hi", "temperature": 9.0},
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let err = decode_event(topics::LLM_REQUEST, &bytes).unwrap_err();
        assert!(matches!(err, ContractError::OutOfRange { .. }));
    }
}
