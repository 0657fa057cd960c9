//! LLM contracts: request/response, streamed deltas, cancellation, and the
//! tool-call round trip with the MCP bridge.

use serde::{Deserialize, Serialize};

use super::memory::MemoryItem;
use super::{ContractError, EventPayload};

/// A completion request issued by the router.
///
/// `id` pairs the response and stream deltas with this request; `utt_id`
/// threads the conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    pub text: String,
    /// Retrieved memory items attached before the call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<MemoryItem>,
    /// Active character name, from the retained `system/character/current`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character: Option<String>,
    /// Sampling temperature in `[0, 2]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Whether the worker should emit `llm/stream` deltas.
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Tool results fed back as a continuation of an earlier request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolCallResult>,
}

fn default_stream() -> bool {
    true
}

impl EventPayload for LlmRequest {
    const EVENT_TYPE: &'static str = "llm.request";

    fn validate(&self) -> Result<(), ContractError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ContractError::OutOfRange {
                    field: "temperature",
                    value: f64::from(t),
                    range: "[0, 2]",
                });
            }
        }
        Ok(())
    }
}

/// One streamed token batch. `seq` is strictly monotonic per request id;
/// consumers reorder by it and warn (never fail) on gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmStreamDelta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    pub seq: u64,
    pub delta: String,
    /// Set on the last delta of the stream.
    #[serde(default)]
    pub done: bool,
}

impl EventPayload for LlmStreamDelta {
    const EVENT_TYPE: &'static str = "llm.stream";
}

/// The terminal outcome of a request: exactly one of `reply` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventPayload for LlmResponse {
    const EVENT_TYPE: &'static str = "llm.response";

    fn validate(&self) -> Result<(), ContractError> {
        if self.reply.is_none() && self.error.is_none() {
            return Err(ContractError::Invalid(
                "llm.response carries neither reply nor error".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Cancel an in-flight request. Consumers drop any later stream delta or
/// response matching the cancelled id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LlmCancel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventPayload for LlmCancel {
    const EVENT_TYPE: &'static str = "llm.cancel";
}

/// One tool advertised by the MCP bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments, passed through opaquely.
    #[serde(default)]
    pub schema: serde_json::Value,
}

/// The retained registry of available tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolRegistry {
    pub tools: Vec<ToolSpec>,
}

impl EventPayload for ToolRegistry {
    const EVENT_TYPE: &'static str = "llm.tools.registry";
}

/// The LLM worker asks for a tool invocation mid-generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolCallRequest {
    /// Stable id for this call; the result echoes it.
    pub call_id: String,
    /// The LLM request this call belongs to.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl EventPayload for ToolCallRequest {
    const EVENT_TYPE: &'static str = "llm.tool.call.request";
}

/// Bridge's answer to a tool call. `call_id` pairs it with the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolCallResult {
    pub call_id: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventPayload for ToolCallResult {
    const EVENT_TYPE: &'static str = "llm.tool.call.result";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_range_enforced() {
        let mut req = LlmRequest {
            id: "r1".into(),
            utt_id: Some("u1".into()),
            text: "hello".into(),
            context: Vec::new(),
            character: None,
            temperature: Some(2.5),
            stream: true,
            tool_results: Vec::new(),
        };
        assert!(req.validate().is_err());
        req.temperature = Some(0.7);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn response_needs_reply_or_error() {
        let empty = LlmResponse {
            id: "r1".into(),
            utt_id: None,
            reply: None,
            error: None,
        };
        assert!(empty.validate().is_err());
        let err = LlmResponse {
            reply: None,
            error: Some("backend down".into()),
            ..empty.clone()
        };
        assert!(err.validate().is_ok());
    }

    #[test]
    fn stream_defaults() {
        let json = r#"{"id":"r1","text":"hi"}"#;
        let req: LlmRequest = serde_json::from_str(json).unwrap();
        assert!(req.stream);
        assert!(req.context.is_empty());
    }

    #[test]
    fn unknown_field_rejected() {
        let json = r#"{"id":"r1","text":"hi","max_tokens":128}"#;
        assert!(serde_json::from_str::<LlmRequest>(json).is_err());
    }
}
