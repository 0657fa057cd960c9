//! Async shell around [`TurnMachine`]: subscriptions in, actions out.
//!
//! All inbound events and timer fires funnel through one channel so turn
//! processing is strictly serialized; the machine never sees two events at
//! once. Broker disconnects are absorbed by the shared client; the machine
//! keeps its state and subscriptions are restored underneath it.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RouterConfig;
use crate::contracts::memory::MemoryQuery;
use crate::contracts::tts::{TtsAction, TtsControl, TtsSay};
use crate::contracts::wake::{MicCommand, MicSwitch};
use crate::contracts::{topics, Correlation, DomainEvent, Inbound};
use crate::error::Result;
use crate::mqtt::{handler, MqttClient};
use crate::router::state::{Action, TimerKind, TurnMachine};

/// Queue between subscription handlers and the serialized turn loop.
const EVENT_QUEUE_CAPACITY: usize = 64;

enum RouterMsg {
    Event(Inbound),
    Timeout { kind: TimerKind, epoch: u64 },
}

/// The conversation router service.
pub struct RouterService {
    client: MqttClient,
    config: RouterConfig,
}

impl RouterService {
    pub fn new(client: MqttClient, config: RouterConfig) -> Self {
        Self { client, config }
    }

    /// Subscribe to the conversation topics and run the turn loop until the
    /// token is cancelled.
    ///
    /// # Errors
    ///
    /// Fails when the initial subscriptions cannot be established.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel::<RouterMsg>(EVENT_QUEUE_CAPACITY);

        let conversation_topics = [
            topics::WAKE_EVENT,
            topics::STT_PARTIAL,
            topics::STT_FINAL,
            topics::MEMORY_RESULTS,
            topics::LLM_STREAM,
            topics::LLM_RESPONSE,
            topics::LLM_TOOL_CALL_REQUEST,
            topics::LLM_TOOL_CALL_RESULT,
            topics::TTS_STATUS,
            topics::CHARACTER_CURRENT,
            topics::CHARACTER_GET,
        ];
        for topic in conversation_topics {
            let tx = events_tx.clone();
            self.client
                .subscribe(
                    topic,
                    handler(move |inbound| {
                        let tx = tx.clone();
                        async move {
                            // Queue full means the turn loop is behind; block
                            // here so broker order is preserved per topic.
                            let _ = tx.send(RouterMsg::Event(inbound)).await;
                            Ok(())
                        }
                    }),
                )
                .await?;
        }
        info!("router subscriptions established");

        self.turn_loop(events_tx, events_rx, cancel).await;
        Ok(())
    }

    async fn turn_loop(
        &self,
        events_tx: mpsc::Sender<RouterMsg>,
        mut events_rx: mpsc::Receiver<RouterMsg>,
        cancel: CancellationToken,
    ) {
        let mut machine = TurnMachine::new(self.config.use_memory);
        let mut timers: HashMap<TimerKind, JoinHandle<()>> = HashMap::new();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break,
                msg = events_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let actions = match msg {
                RouterMsg::Event(inbound) => self.feed(&mut machine, inbound, &cancel),
                RouterMsg::Timeout { kind, epoch } => machine.on_timeout(kind, epoch),
            };

            for action in actions {
                self.perform(action, &events_tx, &mut timers).await;
            }
        }

        for (_, timer) in timers.drain() {
            timer.abort();
        }
        info!(phase = ?machine.phase(), "router loop stopped");
    }

    fn feed(
        &self,
        machine: &mut TurnMachine,
        inbound: Inbound,
        cancel: &CancellationToken,
    ) -> Vec<Action> {
        match inbound.event {
            DomainEvent::WakeEvent(ev) => {
                if cancel.is_cancelled() {
                    debug!("wake during shutdown ignored");
                    return Vec::new();
                }
                machine.on_wake(ev.confidence)
            }
            DomainEvent::SttPartial(partial) => {
                // UI-bound only; no state change.
                debug!(utt_id = %partial.utt_id, text = %partial.text, "partial transcript");
                Vec::new()
            }
            DomainEvent::SttFinal(final_) => machine.on_stt_final(final_),
            DomainEvent::MemoryResults(results) => machine.on_memory_results(results),
            DomainEvent::LlmStream(delta) => machine.on_llm_stream(delta),
            DomainEvent::LlmResponse(response) => machine.on_llm_response(response),
            DomainEvent::ToolCallRequest(request) => machine.on_tool_call_request(request),
            DomainEvent::ToolCallResult(result) => machine.on_tool_call_result(result),
            DomainEvent::TtsStatus(status) => machine.on_tts_status(status),
            DomainEvent::CharacterCurrent(current) => {
                machine.on_character_current(current.name);
                Vec::new()
            }
            DomainEvent::CharacterGet(_) => machine.on_character_get(),
            other => {
                debug!(event = ?other, "unexpected event on router subscription");
                Vec::new()
            }
        }
    }

    async fn perform(
        &self,
        action: Action,
        events_tx: &mpsc::Sender<RouterMsg>,
        timers: &mut HashMap<TimerKind, JoinHandle<()>>,
    ) {
        match action {
            Action::EnableMic => {
                self.publish_mic(MicSwitch::Enable).await;
            }
            Action::DisableMic => {
                self.publish_mic(MicSwitch::Disable).await;
            }
            Action::MemoryQuery { utt_id, text } => {
                let query = MemoryQuery {
                    text,
                    utt_id: Some(utt_id.clone()),
                    top_k: 5,
                };
                self.publish(topics::MEMORY_QUERY, Correlation::utterance(utt_id), query)
                    .await;
            }
            Action::LlmRequest(request) => {
                let correlation = match &request.utt_id {
                    Some(utt) => Correlation::full(request.id.clone(), utt.clone()),
                    None => Correlation::request(request.id.clone()),
                };
                self.publish(topics::LLM_REQUEST, correlation, request).await;
            }
            Action::LlmCancel { id } => {
                let cancel = crate::contracts::llm::LlmCancel {
                    id: id.clone(),
                    reason: Some("superseded".to_owned()),
                };
                self.publish(topics::LLM_CANCEL, Correlation::request(id), cancel)
                    .await;
            }
            Action::TtsSay { utt_id, text } => {
                let say = TtsSay {
                    text,
                    utt_id: Some(utt_id.clone()),
                    voice: None,
                };
                self.publish(topics::TTS_SAY, Correlation::utterance(utt_id), say)
                    .await;
            }
            Action::TtsStop { utt_id } => {
                let control = TtsControl {
                    action: TtsAction::Stop,
                    utt_id: Some(utt_id.clone()),
                };
                self.publish(topics::TTS_CONTROL, Correlation::utterance(utt_id), control)
                    .await;
            }
            Action::CharacterResult(result) => {
                self.publish(topics::CHARACTER_RESULT, Correlation::none(), result)
                    .await;
            }
            Action::StartTimer { kind, epoch } => {
                let duration = match kind {
                    TimerKind::SttSilence => self.config.stt_silence,
                    TimerKind::Memory => self.config.memory_timeout,
                    TimerKind::Llm => self.config.llm_timeout,
                    TimerKind::Tool => self.config.tool_timeout,
                    TimerKind::Speaking => self.config.tts_max,
                };
                if let Some(previous) = timers.insert(kind, spawn_timer(kind, epoch, duration, events_tx.clone())) {
                    previous.abort();
                }
            }
        }
    }

    async fn publish_mic(&self, command: MicSwitch) {
        let cmd = MicCommand { command };
        self.publish(topics::WAKE_MIC, Correlation::none(), cmd).await;
    }

    async fn publish<T: crate::contracts::EventPayload>(
        &self,
        topic: &str,
        correlation: Correlation,
        data: T,
    ) {
        if let Err(e) = self.client.publish_event(topic, correlation, data).await {
            error!(topic, error = %e, "router publish failed");
        }
    }
}

fn spawn_timer(
    kind: TimerKind,
    epoch: u64,
    duration: std::time::Duration,
    tx: mpsc::Sender<RouterMsg>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let _ = tx.send(RouterMsg::Timeout { kind, epoch }).await;
    })
}

// Re-exported so callers can inspect the machine's phases in diagnostics.
pub use crate::router::state::Phase as RouterPhase;
