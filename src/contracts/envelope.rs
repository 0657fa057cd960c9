//! The JSON envelope wrapped around every payload on the bus.
//!
//! An envelope is created at publish time, immutable afterwards, and
//! discarded after delivery. Unknown top-level fields are rejected so that
//! contract drift between services surfaces as a validation error instead of
//! silent data loss.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ContractError;

/// Correlation keys threaded through a message.
///
/// `correlate` is the generic cross-service key (a request id, a capture id).
/// `utt_id` threads one conversational turn from `stt/final` through every
/// downstream `llm/*` and `tts/*` message until `speaking_end`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub correlate: Option<String>,
    pub utt_id: Option<String>,
}

impl Correlation {
    /// No correlation keys at all (health, keepalive, wake events).
    pub fn none() -> Self {
        Self::default()
    }

    /// Correlate on a request/capture id only.
    pub fn request(id: impl Into<String>) -> Self {
        Self {
            correlate: Some(id.into()),
            utt_id: None,
        }
    }

    /// Thread an utterance id only.
    pub fn utterance(utt_id: impl Into<String>) -> Self {
        Self {
            correlate: None,
            utt_id: Some(utt_id.into()),
        }
    }

    /// Both keys: a request id inside an utterance.
    pub fn full(id: impl Into<String>, utt_id: impl Into<String>) -> Self {
        Self {
            correlate: Some(id.into()),
            utt_id: Some(utt_id.into()),
        }
    }
}

/// Versioned JSON wrapper carried by every message on the bus.
///
/// The legacy field spellings (`id`, `timestamp`) are accepted on decode via
/// aliases; this fleet always emits `message_id` / `ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    /// Unique per message.
    #[serde(alias = "id")]
    pub message_id: String,
    /// Fully-qualified event name, e.g. `stt.final`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer clock, Unix seconds.
    #[serde(alias = "timestamp")]
    pub ts: f64,
    /// Publishing client id.
    pub source: String,
    /// Cross-service correlation key (request id, capture id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlate: Option<String>,
    /// Utterance id for the conversational turn this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    /// Domain payload, validated against the per-type schema.
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    /// Wrap `data` in a fresh envelope: new `message_id`, current timestamp.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation: Correlation,
        data: T,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().simple().to_string(),
            event_type: event_type.into(),
            ts: now_unix(),
            source: source.into(),
            correlate: correlation.correlate,
            utt_id: correlation.utt_id,
            data,
        }
    }

    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ContractError> {
        serde_json::to_vec(self).map_err(|e| ContractError::Serialize(e.to_string()))
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse an envelope from wire bytes, rejecting unknown top-level fields.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContractError> {
        serde_json::from_slice(bytes).map_err(|e| ContractError::Deserialize {
            reason: e.to_string(),
            preview: payload_preview(bytes),
        })
    }
}

impl<T> Envelope<T> {
    /// The correlation keys of this envelope, as a value.
    pub fn correlation(&self) -> Correlation {
        Correlation {
            correlate: self.correlate.clone(),
            utt_id: self.utt_id.clone(),
        }
    }
}

/// Current Unix time as fractional seconds.
pub fn now_unix() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Truncated raw-payload preview for validation-failure logs.
pub fn payload_preview(bytes: &[u8]) -> String {
    const PREVIEW_LEN: usize = 256;
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= PREVIEW_LEN {
        text.into_owned()
    } else {
        let mut end = PREVIEW_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Ping {
        text: String,
    }

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(
            "test.ping",
            "unit-test",
            Correlation::utterance("u1"),
            Ping {
                text: "hello".into(),
            },
        );
        let bytes = env.to_bytes().unwrap();
        let decoded: Envelope<Ping> = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.utt_id.as_deref(), Some("u1"));
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let raw = json!({
            "message_id": "m1",
            "type": "test.ping",
            "ts": 1.0,
            "source": "s",
            "data": {"text": "x"},
            "bogus": true,
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        let err = Envelope::<Ping>::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("bogus"), "{err}");
    }

    #[test]
    fn accepts_legacy_field_spellings() {
        let raw = json!({
            "id": "m1",
            "type": "test.ping",
            "timestamp": 1.5,
            "source": "s",
            "data": {"text": "x"},
        });
        let env: Envelope<Ping> = Envelope::from_bytes(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert_eq!(env.message_id, "m1");
        assert!((env.ts - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Envelope::new("t", "s", Correlation::none(), Ping { text: "a".into() });
        let b = Envelope::new("t", "s", Correlation::none(), Ping { text: "a".into() });
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn preview_truncates_long_payloads() {
        let long = "x".repeat(1000);
        let p = payload_preview(long.as_bytes());
        assert!(p.len() < 300);
        assert!(p.ends_with('…'));
    }
}
