//! The conversation turn state machine, as a pure synchronous core.
//!
//! Bus events and timer fires go in, bus-side effects come out as
//! [`Action`] values. The async shell in [`super::service`] owns the
//! timers and the MQTT client; everything decision-shaped lives here so it
//! can be tested without a broker.

use std::collections::VecDeque;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::llm::{LlmRequest, LlmResponse, LlmStreamDelta, ToolCallRequest, ToolCallResult};
use crate::contracts::memory::{CharacterResult, MemoryItem, MemoryResults};
use crate::contracts::stt::SttFinal;
use crate::contracts::tts::{TtsEvent, TtsStatus};

/// Spoken when the LLM leg of a turn fails.
const CANNED_ERROR_LINE: &str = "Sorry, I hit a problem answering that.";

/// Cancelled request ids remembered for late-delta suppression.
const CANCELLED_MEMORY: usize = 32;

/// Turn phases. At most one turn is active at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No active turn; microphone armed for the next wake.
    Idle,
    /// Wake fired, microphone routed to STT, waiting for a final transcript.
    Listening,
    /// Waiting on `memory/results` before issuing the LLM request.
    MemoryPending,
    /// LLM request in flight.
    LlmPending,
    /// Tool round-trip in progress (a sub-state of the LLM leg).
    ToolPending,
    /// `tts/say` issued, waiting for `speaking_end`.
    Speaking,
}

/// Timers the shell runs on the machine's behalf. Each `StartTimer` action
/// replaces any previous timer of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SttSilence,
    Memory,
    Llm,
    Tool,
    Speaking,
}

/// Bus-side effects requested by a transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// `wake/mic {command: enable}`: route microphone audio to STT.
    EnableMic,
    /// `wake/mic {command: disable}`: stop routing while thinking/speaking.
    DisableMic,
    /// `memory/query` for the transcript, correlated to the turn.
    MemoryQuery { utt_id: String, text: String },
    /// `llm/request`.
    LlmRequest(LlmRequest),
    /// `llm/cancel` for a request the turn is abandoning.
    LlmCancel { id: String },
    /// `tts/say`; the router emits at most one per `utt_id`.
    TtsSay { utt_id: String, text: String },
    /// `tts/control {action: stop}` for a superseded turn.
    TtsStop { utt_id: String },
    /// `system/character/result` answering a `character/get`.
    CharacterResult(CharacterResult),
    /// Arm (or re-arm) a phase timer. `epoch` guards against stale fires.
    StartTimer { kind: TimerKind, epoch: u64 },
}

#[derive(Debug)]
struct Turn {
    utt_id: String,
    /// True until `stt/final` supplies the authoritative utterance id.
    provisional: bool,
    text: String,
    request_id: Option<String>,
    context: Vec<MemoryItem>,
    tool_results: Vec<ToolCallResult>,
    pending_call: Option<String>,
    say_emitted: bool,
    last_seq: Option<u64>,
}

impl Turn {
    fn new() -> Self {
        Self {
            utt_id: Uuid::new_v4().simple().to_string(),
            provisional: true,
            text: String::new(),
            request_id: None,
            context: Vec::new(),
            tool_results: Vec::new(),
            pending_call: None,
            say_emitted: false,
            last_seq: None,
        }
    }
}

/// The router's state machine.
pub struct TurnMachine {
    phase: Phase,
    turn: Option<Turn>,
    use_memory: bool,
    character: Option<String>,
    /// Recently cancelled request ids; late deltas for them are dropped.
    cancelled: VecDeque<String>,
    /// Bumped on every new turn; stale timer fires carry an older value.
    epoch: u64,
    /// Late `llm/stream` / `llm/response` messages dropped after a cancel.
    pub late_dropped: u64,
    /// Observed `seq` gaps on the active stream (warned, never fatal).
    pub seq_gaps: u64,
}

impl TurnMachine {
    pub fn new(use_memory: bool) -> Self {
        Self {
            phase: Phase::Idle,
            turn: None,
            use_memory,
            character: None,
            cancelled: VecDeque::new(),
            epoch: 0,
            late_dropped: 0,
            seq_gaps: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The active turn's utterance id, if a turn is live.
    pub fn active_utt_id(&self) -> Option<&str> {
        self.turn.as_ref().map(|t| t.utt_id.as_str())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn remember_cancelled(&mut self, id: String) {
        if self.cancelled.len() >= CANCELLED_MEMORY {
            self.cancelled.pop_front();
        }
        self.cancelled.push_back(id);
    }

    fn is_cancelled(&self, id: &str) -> bool {
        self.cancelled.iter().any(|c| c == id)
    }

    fn set_phase(&mut self, next: Phase) {
        if self.phase != next {
            info!(from = ?self.phase, to = ?next, utt_id = self.active_utt_id(), "turn phase");
            self.phase = next;
        }
    }

    /// Tear down the current turn, cancelling an outstanding LLM request and
    /// stopping speech as needed. Appends the teardown actions.
    fn abandon_turn(&mut self, actions: &mut Vec<Action>, stop_tts: bool) {
        if let Some(turn) = self.turn.take() {
            if let Some(id) = turn.request_id {
                if !self.is_cancelled(&id)
                    && matches!(
                        self.phase,
                        Phase::LlmPending | Phase::ToolPending | Phase::Speaking
                    )
                {
                    actions.push(Action::LlmCancel { id: id.clone() });
                    self.remember_cancelled(id);
                }
            }
            if stop_tts && matches!(self.phase, Phase::Speaking | Phase::LlmPending | Phase::ToolPending) {
                actions.push(Action::TtsStop {
                    utt_id: turn.utt_id,
                });
            }
        }
    }

    /// Enter `Idle` with the microphone re-armed for the next wake.
    fn rearm(&mut self, actions: &mut Vec<Action>) {
        self.turn = None;
        actions.push(Action::EnableMic);
        self.set_phase(Phase::Idle);
    }

    /// Begin a fresh turn in `Listening`.
    fn start_turn(&mut self, actions: &mut Vec<Action>) {
        self.epoch += 1;
        self.turn = Some(Turn::new());
        actions.push(Action::EnableMic);
        actions.push(Action::StartTimer {
            kind: TimerKind::SttSilence,
            epoch: self.epoch,
        });
        self.set_phase(Phase::Listening);
    }

    fn build_request(&mut self) -> Option<LlmRequest> {
        let character = self.character.clone();
        let turn = self.turn.as_mut()?;
        let id = Uuid::new_v4().simple().to_string();
        turn.request_id = Some(id.clone());
        turn.last_seq = None;
        Some(LlmRequest {
            id,
            utt_id: Some(turn.utt_id.clone()),
            text: turn.text.clone(),
            context: turn.context.clone(),
            character,
            temperature: None,
            stream: true,
            tool_results: Vec::new(),
        })
    }

    // -- Bus inputs --

    /// `wake/event`: start a turn, superseding any active one.
    pub fn on_wake(&mut self, confidence: f32) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.phase {
            Phase::Idle => {}
            Phase::Listening => {
                debug!("re-wake during listening, restarting turn");
                self.turn = None;
            }
            Phase::MemoryPending | Phase::LlmPending | Phase::ToolPending | Phase::Speaking => {
                debug!("re-wake supersedes active turn");
                self.abandon_turn(&mut actions, true);
            }
        }
        info!(confidence, "wake event, arming");
        self.start_turn(&mut actions);
        actions
    }

    /// `stt/final`: close the listening leg and move to memory or LLM.
    pub fn on_stt_final(&mut self, final_: SttFinal) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Listening {
            debug!(phase = ?self.phase, "stt/final outside listening, ignored");
            return actions;
        }
        let Some(turn) = self.turn.as_mut() else {
            return actions;
        };
        // STT owns the authoritative utterance id.
        turn.utt_id = final_.utt_id;
        turn.provisional = false;
        turn.text = final_.text.trim().to_owned();

        if turn.text.is_empty() {
            info!("empty transcript, re-arming");
            self.start_turn(&mut actions);
            return actions;
        }

        actions.push(Action::DisableMic);
        if self.use_memory {
            actions.push(Action::MemoryQuery {
                utt_id: turn.utt_id.clone(),
                text: turn.text.clone(),
            });
            actions.push(Action::StartTimer {
                kind: TimerKind::Memory,
                epoch: self.epoch,
            });
            self.set_phase(Phase::MemoryPending);
        } else {
            self.issue_llm_request(&mut actions);
        }
        actions
    }

    fn issue_llm_request(&mut self, actions: &mut Vec<Action>) {
        if let Some(request) = self.build_request() {
            actions.push(Action::LlmRequest(request));
            actions.push(Action::StartTimer {
                kind: TimerKind::Llm,
                epoch: self.epoch,
            });
            self.set_phase(Phase::LlmPending);
        }
    }

    /// `memory/results`: attach context and issue the LLM request.
    pub fn on_memory_results(&mut self, results: MemoryResults) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::MemoryPending {
            return actions;
        }
        let matches_turn = results.utt_id.as_deref() == self.active_utt_id();
        if let Some(turn) = self.turn.as_mut() {
            if matches_turn {
                turn.context = results.items;
            }
        }
        self.issue_llm_request(&mut actions);
        actions
    }

    /// `llm/stream`: monitor ordering; drop late deltas for cancelled ids.
    pub fn on_llm_stream(&mut self, delta: LlmStreamDelta) -> Vec<Action> {
        if self.is_cancelled(&delta.id) {
            self.late_dropped += 1;
            debug!(id = %delta.id, seq = delta.seq, "stream delta for cancelled request dropped");
            return Vec::new();
        }
        let Some(turn) = self.turn.as_mut() else {
            return Vec::new();
        };
        if turn.request_id.as_deref() != Some(delta.id.as_str()) {
            return Vec::new();
        }
        let gap = match turn.last_seq {
            Some(last) if delta.seq > last + 1 => Some(last + 1),
            _ => None,
        };
        turn.last_seq = Some(delta.seq);
        if let Some(expected) = gap {
            self.seq_gaps += 1;
            warn!(id = %delta.id, expected, got = delta.seq, "stream seq gap");
        }
        Vec::new()
    }

    /// `llm/response`: speak the reply, or the canned error line.
    pub fn on_llm_response(&mut self, response: LlmResponse) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.is_cancelled(&response.id) {
            self.late_dropped += 1;
            debug!(id = %response.id, "response for cancelled request dropped");
            return actions;
        }
        if !matches!(self.phase, Phase::LlmPending | Phase::ToolPending) {
            return actions;
        }
        let Some(turn) = self.turn.as_mut() else {
            return actions;
        };
        if turn.request_id.as_deref() != Some(response.id.as_str()) {
            debug!(id = %response.id, "response for stale request ignored");
            return actions;
        }

        if let Some(error) = response.error {
            warn!(id = %response.id, error, "llm error, speaking canned line");
            let utt_id = turn.utt_id.clone();
            actions.push(Action::TtsSay {
                utt_id,
                text: CANNED_ERROR_LINE.to_owned(),
            });
            self.rearm(&mut actions);
            return actions;
        }

        let reply = response.reply.unwrap_or_default();
        if reply.trim().is_empty() {
            self.rearm(&mut actions);
            return actions;
        }
        if turn.say_emitted {
            warn!(utt_id = %turn.utt_id, "say already emitted for turn, ignoring");
            return actions;
        }
        turn.say_emitted = true;
        actions.push(Action::TtsSay {
            utt_id: turn.utt_id.clone(),
            text: reply,
        });
        actions.push(Action::StartTimer {
            kind: TimerKind::Speaking,
            epoch: self.epoch,
        });
        self.set_phase(Phase::Speaking);
        actions
    }

    /// `llm/tool.call.request`: enter the tool sub-state and wait for the
    /// bridge's result.
    pub fn on_tool_call_request(&mut self, request: ToolCallRequest) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::LlmPending {
            return actions;
        }
        let Some(turn) = self.turn.as_mut() else {
            return actions;
        };
        if turn.request_id.as_deref() != Some(request.id.as_str()) {
            return actions;
        }
        debug!(call_id = %request.call_id, tool = %request.name, "tool round-trip started");
        turn.pending_call = Some(request.call_id);
        actions.push(Action::StartTimer {
            kind: TimerKind::Tool,
            epoch: self.epoch,
        });
        self.set_phase(Phase::ToolPending);
        actions
    }

    /// `llm/tool.call.result`: feed the result back as a continuation of the
    /// same request id.
    pub fn on_tool_call_result(&mut self, result: ToolCallResult) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::ToolPending {
            return actions;
        }
        let character = self.character.clone();
        let epoch = self.epoch;
        let Some(turn) = self.turn.as_mut() else {
            return actions;
        };
        if turn.pending_call.as_deref() != Some(result.call_id.as_str()) {
            debug!(call_id = %result.call_id, "tool result for unknown call ignored");
            return actions;
        }
        turn.pending_call = None;
        turn.tool_results.push(result);
        let Some(id) = turn.request_id.clone() else {
            return actions;
        };
        let continuation = LlmRequest {
            id,
            utt_id: Some(turn.utt_id.clone()),
            text: turn.text.clone(),
            context: turn.context.clone(),
            character,
            temperature: None,
            stream: true,
            tool_results: turn.tool_results.clone(),
        };
        actions.push(Action::LlmRequest(continuation));
        actions.push(Action::StartTimer {
            kind: TimerKind::Llm,
            epoch,
        });
        self.set_phase(Phase::LlmPending);
        actions
    }

    /// `tts/status`: `speaking_end` for the active turn closes it.
    pub fn on_tts_status(&mut self, status: TtsStatus) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.phase != Phase::Speaking {
            return actions;
        }
        match status.event {
            TtsEvent::SpeakingStart => {}
            TtsEvent::SpeakingEnd => {
                if status.utt_id.as_deref() == self.active_utt_id() {
                    info!(utt_id = self.active_utt_id(), "turn complete");
                    self.rearm(&mut actions);
                } else {
                    debug!("speaking_end for foreign utt_id ignored");
                }
            }
        }
        actions
    }

    /// Retained `system/character/current` changed.
    pub fn on_character_current(&mut self, name: String) {
        debug!(character = %name, "active character updated");
        self.character = Some(name);
    }

    /// `system/character/get`: answer directly when we know the character.
    pub fn on_character_get(&self) -> Vec<Action> {
        match &self.character {
            Some(name) => vec![Action::CharacterResult(CharacterResult {
                name: name.clone(),
                persona: None,
            })],
            None => Vec::new(),
        }
    }

    /// A phase timer fired. Stale epochs are ignored.
    pub fn on_timeout(&mut self, kind: TimerKind, epoch: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if epoch != self.epoch {
            return actions;
        }
        match (kind, self.phase) {
            (TimerKind::SttSilence, Phase::Listening) => {
                info!("silence window elapsed, abandoning turn");
                self.rearm(&mut actions);
            }
            (TimerKind::Memory, Phase::MemoryPending) => {
                warn!("memory query timed out, proceeding without context");
                self.issue_llm_request(&mut actions);
            }
            (TimerKind::Llm, Phase::LlmPending) | (TimerKind::Tool, Phase::ToolPending) => {
                warn!(?kind, "llm leg timed out");
                self.abandon_turn(&mut actions, false);
                self.rearm(&mut actions);
            }
            (TimerKind::Speaking, Phase::Speaking) => {
                warn!("max speech window elapsed, stopping playback");
                if let Some(utt_id) = self.active_utt_id().map(str::to_owned) {
                    actions.push(Action::TtsStop { utt_id });
                }
                self.rearm(&mut actions);
            }
            _ => {}
        }
        actions
    }
}
