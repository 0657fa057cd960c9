//! Memory and character contracts.
//!
//! The character topics live under `system/character/*`; the retained
//! `current` value acts as a small replicated state layer: late subscribers
//! always observe the active character.

use serde::{Deserialize, Serialize};

use super::{ContractError, EventPayload};

/// Retrieval request issued by the router before an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MemoryQuery {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_top_k() -> u32 {
    5
}

impl EventPayload for MemoryQuery {
    const EVENT_TYPE: &'static str = "memory.query";

    fn validate(&self) -> Result<(), ContractError> {
        if self.top_k == 0 {
            return Err(ContractError::OutOfRange {
                field: "top_k",
                value: 0.0,
                range: "[1, ..)",
            });
        }
        Ok(())
    }
}

/// One retrieved memory item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MemoryItem {
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Retrieval results, correlated to the query's `utt_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MemoryResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    pub items: Vec<MemoryItem>,
}

impl EventPayload for MemoryResults {
    const EVENT_TYPE: &'static str = "memory.results";
}

/// The active character, retained on `system/character/current`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CharacterCurrent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl EventPayload for CharacterCurrent {
    const EVENT_TYPE: &'static str = "character.current";
}

/// Ask for the active character (for services that missed the retained value).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CharacterGet {}

impl EventPayload for CharacterGet {
    const EVENT_TYPE: &'static str = "character.get";
}

/// Direct answer to a `character.get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CharacterResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl EventPayload for CharacterResult {
    const EVENT_TYPE: &'static str = "character.result";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_defaults_and_validates() {
        let q: MemoryQuery = serde_json::from_str(r#"{"text":"coffee"}"#).unwrap();
        assert_eq!(q.top_k, 5);
        let zero = MemoryQuery { top_k: 0, ..q };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn character_roundtrip() {
        let c = CharacterCurrent {
            name: "tars".into(),
            persona: Some("dry wit, 90% honesty".into()),
            voice: None,
        };
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(serde_json::from_str::<CharacterCurrent>(&json).unwrap(), c);
    }
}
