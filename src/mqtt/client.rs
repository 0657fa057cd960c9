//! Shared async MQTT client used by every service in the fleet.
//!
//! Wraps `rumqttc::AsyncClient` with envelope publishing, a subscription
//! registry restored after every reconnect, an optional dedup pass, retained
//! health publication, and an application-level heartbeat with a reconnect
//! watchdog.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, Publish, QoS,
};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::contracts::system::{HealthStatus, Keepalive};
use crate::contracts::{
    decode_event, encode_event, topics, ContractError, Correlation, Envelope, EventPayload, Inbound,
    Qos as ContractQos,
};
use crate::mqtt::dedup::{dedup_key, DedupCache};

/// Wait on the first CONNACK before `connect` returns.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for individual publish/subscribe operations.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounded wait for the dispatch task during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Capacity of the rumqttc request channel.
const REQUEST_QUEUE_CAPACITY: usize = 64;
/// Capacity of the event-loop → dispatch queue.
const DISPATCH_QUEUE_CAPACITY: usize = 256;
/// Consecutive heartbeat misses before the watchdog forces a reconnect.
const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Transport and client-state errors.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("client is {state}, not connected")]
    NotConnected { state: &'static str },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Client lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

impl LinkState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Boxed future returned by subscription handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = crate::error::Result<()>> + Send>>;
/// A subscription handler. Errors are logged by the dispatch task and never
/// unwind the loop.
pub type Handler = Arc<dyn Fn(Inbound) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
{
    Arc::new(move |inbound| Box::pin(f(inbound)) as HandlerFuture)
}

struct Inner {
    config: MqttConfig,
    client: AsyncClient,
    state: Mutex<LinkState>,
    handlers: RwLock<HashMap<String, Handler>>,
    cancel: CancellationToken,
    connected_tx: watch::Sender<bool>,
    dispatch_tx: mpsc::Sender<Publish>,
    first_connect_done: AtomicBool,
    shutdown_started: AtomicBool,
    /// Messages dropped for failing their topic contract.
    dropped_invalid: AtomicU64,
}

impl Inner {
    fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LinkState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "client state");
            *state = next;
        }
    }

    fn to_rumqtt(qos: ContractQos) -> QoS {
        match qos {
            ContractQos::AtMostOnce => QoS::AtMostOnce,
            ContractQos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }

    /// Publish an enveloped event without a connected-state check. Used by
    /// the event loop and heartbeat, which run across state transitions.
    async fn publish_event_unchecked<T: EventPayload>(
        &self,
        topic: &str,
        correlation: Correlation,
        data: T,
    ) -> Result<String, MqttError> {
        let env = encode_event(topic, &self.config.source_name, correlation, data)?;
        let policy = topics::delivery_policy(topic);
        let bytes = env.to_bytes()?;
        debug!(
            topic,
            message_id = %env.message_id,
            event_type = %env.event_type,
            "outbound event"
        );
        timeout(
            OPERATION_TIMEOUT,
            self.client
                .publish(topic, Self::to_rumqtt(policy.qos), policy.retain, bytes),
        )
        .await
        .map_err(|_| MqttError::Timeout("publish"))?
        .map_err(|e| MqttError::Publish(e.to_string()))?;
        Ok(env.message_id)
    }

    async fn publish_health_now(&self, status: HealthStatus) -> Result<(), MqttError> {
        let topic = topics::health_topic(&self.config.source_name);
        self.publish_event_unchecked(&topic, Correlation::none(), status)
            .await?;
        Ok(())
    }

    /// Re-issue every registered subscription. Runs on each (re)connect
    /// before any queued inbound publish is processed, so dispatch resumes
    /// against the full set.
    async fn restore_subscriptions(&self) {
        let filters: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        for filter in filters {
            let qos = Self::to_rumqtt(topics::delivery_policy(&filter).qos);
            if let Err(e) = self.client.subscribe(&filter, qos).await {
                error!(filter, error = %e, "re-subscribe failed");
            }
        }
    }
}

/// The shared client. Cheap to clone; all clones drive one connection.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<Inner>,
    event_loop: Arc<Mutex<Option<EventLoop>>>,
    dispatch_rx: Arc<Mutex<Option<mpsc::Receiver<Publish>>>>,
    dispatch_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    event_loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MqttClient {
    /// Build the client in `Created` state. No I/O happens until
    /// [`connect`](Self::connect).
    pub fn new(config: MqttConfig) -> Self {
        let mut options = MqttOptions::new(
            &config.client_id,
            &config.broker.host,
            config.broker.port,
        );
        options.set_keep_alive(config.keepalive);
        if let Some(user) = &config.broker.username {
            options.set_credentials(user, config.broker.password.as_deref().unwrap_or(""));
        }
        if config.enable_health {
            // The broker republishes this if we vanish without a shutdown.
            let will = Envelope::new(
                HealthStatus::EVENT_TYPE,
                &config.source_name,
                Correlation::none(),
                HealthStatus::failed("connection lost"),
            );
            if let Ok(payload) = will.to_bytes() {
                options.set_last_will(LastWill::new(
                    topics::health_topic(&config.source_name),
                    payload,
                    QoS::AtLeastOnce,
                    true,
                ));
            }
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let (connected_tx, _) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                client,
                state: Mutex::new(LinkState::Created),
                handlers: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
                connected_tx,
                dispatch_tx,
                first_connect_done: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                dropped_invalid: AtomicU64::new(0),
            }),
            event_loop: Arc::new(Mutex::new(Some(event_loop))),
            dispatch_rx: Arc::new(Mutex::new(Some(dispatch_rx))),
            dispatch_handle: Arc::new(Mutex::new(None)),
            event_loop_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    /// Count of inbound messages dropped for contract violations.
    pub fn dropped_invalid(&self) -> u64 {
        self.inner.dropped_invalid.load(Ordering::Relaxed)
    }

    /// Cancellation token shared with the client's background tasks.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn ensure_connected(&self) -> Result<(), MqttError> {
        let state = self.inner.state();
        if state == LinkState::Connected {
            Ok(())
        } else {
            Err(MqttError::NotConnected {
                state: state.as_str(),
            })
        }
    }

    /// Connect to the broker, start the event-loop / dispatch / heartbeat
    /// tasks, and wait for the first CONNACK.
    ///
    /// # Errors
    ///
    /// Fails when called twice, or when the broker does not accept the
    /// connection within the connect timeout.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(MqttError::Connect("already connected".to_owned()))?;
        let dispatch_rx = self
            .dispatch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(MqttError::Connect("already connected".to_owned()))?;

        self.inner.set_state(LinkState::Connecting);

        let loop_handle = tokio::spawn(run_event_loop(Arc::clone(&self.inner), event_loop));
        *self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(loop_handle);

        let dispatch_handle = tokio::spawn(run_dispatch(Arc::clone(&self.inner), dispatch_rx));
        *self
            .dispatch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(dispatch_handle);

        if self.inner.config.enable_heartbeat {
            tokio::spawn(run_heartbeat(Arc::clone(&self.inner)));
        }

        let mut connected = self.inner.connected_tx.subscribe();
        timeout(CONNECT_TIMEOUT, connected.wait_for(|up| *up))
            .await
            .map_err(|_| MqttError::Timeout("connect"))?
            .map_err(|_| MqttError::Connect("client tasks exited".to_owned()))?;
        info!(
            client_id = %self.inner.config.client_id,
            broker = %self.inner.config.broker.host,
            "connected"
        );
        Ok(())
    }

    /// Build an envelope for `data`, then publish with the QoS/retain policy
    /// declared for `topic`. Returns the envelope's `message_id`.
    ///
    /// # Errors
    ///
    /// `NotConnected` outside the `Connected` state; contract errors when
    /// the payload does not belong to the topic or fails validation.
    pub async fn publish_event<T: EventPayload>(
        &self,
        topic: &str,
        correlation: Correlation,
        data: T,
    ) -> Result<String, MqttError> {
        self.ensure_connected()?;
        self.inner
            .publish_event_unchecked(topic, correlation, data)
            .await
    }

    /// Publish a retained health value for this client. A no-op when health
    /// publication is disabled in config.
    pub async fn publish_health(&self, status: HealthStatus) -> Result<(), MqttError> {
        if !self.inner.config.enable_health {
            return Ok(());
        }
        self.ensure_connected()?;
        self.inner.publish_health_now(status).await
    }

    /// Register `handler` for `topic` (replacing any prior handler) and
    /// subscribe at the topic's policy QoS. The registration survives
    /// reconnects.
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), MqttError> {
        self.ensure_connected()?;
        {
            let mut handlers = self.inner.handlers.write().await;
            if handlers.insert(topic.to_owned(), handler).is_some() {
                debug!(topic, "subscription handler replaced");
            }
        }
        let qos = Inner::to_rumqtt(topics::delivery_policy(topic).qos);
        timeout(OPERATION_TIMEOUT, self.inner.client.subscribe(topic, qos))
            .await
            .map_err(|_| MqttError::Timeout("subscribe"))?
            .map_err(|e| MqttError::Subscribe(e.to_string()))
    }

    /// Graceful shutdown: retained health `shutdown`, stop heartbeat and
    /// dispatch (bounded wait), close the broker connection. Idempotent and
    /// safe to call from any state.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_connected = self.inner.state() == LinkState::Connected;
        self.inner.set_state(LinkState::Disconnecting);

        if was_connected && self.inner.config.enable_health {
            if let Err(e) = self.inner.publish_health_now(HealthStatus::shutdown()).await {
                warn!(error = %e, "shutdown health publish failed");
            }
        }

        self.inner.cancel.cancel();

        let dispatch = self
            .dispatch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatch {
            if timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("dispatch task did not stop within grace period");
            }
        }

        let _ = timeout(Duration::from_secs(2), self.inner.client.disconnect()).await;

        let event_loop = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = event_loop {
            handle.abort();
        }

        self.inner.set_state(LinkState::Disconnected);
        info!(client_id = %self.inner.config.client_id, "shut down");
    }
}

/// Exponential backoff base (no jitter), reset by callers on success.
fn backoff_base(attempt: u32, min: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    min.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

/// Backoff with up to +25% random jitter, so a broker restart does not get
/// the whole fleet reconnecting in lockstep.
fn backoff_with_jitter(attempt: u32, min: Duration, max: Duration) -> Duration {
    let base = backoff_base(attempt, min, max);
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    base.mul_f64(1.0 + jitter)
}

/// Does an MQTT topic filter (possibly with `+`/`#`) match a concrete topic?
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

async fn run_event_loop(inner: Arc<Inner>, mut event_loop: EventLoop) {
    let mut attempt: u32 = 0;
    loop {
        let event = tokio::select! {
            () = inner.cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    error!(code = ?ack.code, "broker rejected connection");
                    inner.set_state(LinkState::Reconnecting);
                    attempt = attempt.saturating_add(1);
                    let delay = backoff_with_jitter(
                        attempt,
                        inner.config.reconnect_min_delay,
                        inner.config.reconnect_max_delay,
                    );
                    tokio::select! {
                        () = inner.cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                attempt = 0;
                let reconnect = inner.first_connect_done.swap(true, Ordering::SeqCst);
                inner.set_state(LinkState::Connected);
                inner.restore_subscriptions().await;
                if inner.config.enable_health {
                    let status = if reconnect {
                        HealthStatus::reconnected()
                    } else {
                        HealthStatus::ready()
                    };
                    if let Err(e) = inner.publish_health_now(status).await {
                        warn!(error = %e, "health publish failed after connect");
                    }
                }
                let _ = inner.connected_tx.send(true);
                if reconnect {
                    info!("reconnected to broker");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // Bounded queue: broker flow control backpressures here
                // rather than dropping messages.
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    sent = inner.dispatch_tx.send(publish) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                inner.set_state(LinkState::Reconnecting);
                let _ = inner.connected_tx.send(false);
                attempt = attempt.saturating_add(1);
                let delay = backoff_with_jitter(
                    attempt,
                    inner.config.reconnect_min_delay,
                    inner.config.reconnect_max_delay,
                );
                warn!(
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "broker connection lost"
                );
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_dispatch(inner: Arc<Inner>, mut rx: mpsc::Receiver<Publish>) {
    let mut dedup = if inner.config.dedupe_ttl > Duration::ZERO {
        Some(DedupCache::new(
            inner.config.dedupe_ttl,
            inner.config.dedupe_max_entries,
        ))
    } else {
        None
    };

    loop {
        let publish = tokio::select! {
            () = inner.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(publish) => publish,
                None => break,
            },
        };
        dispatch_one(&inner, publish, dedup.as_mut()).await;
    }
}

async fn dispatch_one(inner: &Inner, publish: Publish, dedup: Option<&mut DedupCache>) {
    let topic = publish.topic.as_str();

    let handler = {
        let handlers = inner.handlers.read().await;
        match handlers.get(topic) {
            Some(h) => Some(Arc::clone(h)),
            None => handlers
                .iter()
                .find(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, h)| Arc::clone(h)),
        }
    };
    // Unknown subscription: nothing to invoke.
    let Some(handler) = handler else {
        debug!(topic, "no handler registered, dropping");
        return;
    };

    let inbound = match decode_event(topic, &publish.payload) {
        Ok(inbound) => inbound,
        Err(e) => {
            inner.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            error!(topic, error = %e, "invalid payload dropped");
            return;
        }
    };

    if let Some(cache) = dedup {
        let key = dedup_key(
            &inbound.event_type,
            &inbound.message_id,
            inbound.event.seq(),
            &publish.payload,
        );
        if !cache.insert(&key) {
            debug!(topic, message_id = %inbound.message_id, "duplicate suppressed");
            return;
        }
    }

    debug!(
        topic,
        message_id = %inbound.message_id,
        event_type = %inbound.event_type,
        source = %inbound.source,
        "inbound event"
    );
    if let Err(e) = handler(inbound).await {
        error!(topic, error = %e, "handler error");
    }
}

async fn run_heartbeat(inner: Arc<Inner>) {
    let topic = topics::keepalive_topic(&inner.config.source_name);
    let started = Instant::now();
    let mut seq: u64 = 0;
    let mut missed: u32 = 0;
    let mut interval = tokio::time::interval(inner.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so beats start one cadence in.
    interval.tick().await;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if inner.state() != LinkState::Connected {
            missed = missed.saturating_add(1);
        } else {
            let beat = Keepalive {
                seq,
                uptime_s: started.elapsed().as_secs_f64(),
            };
            match inner
                .publish_event_unchecked(&topic, Correlation::none(), beat)
                .await
            {
                Ok(_) => {
                    seq = seq.wrapping_add(1);
                    missed = 0;
                }
                Err(e) => {
                    missed = missed.saturating_add(1);
                    warn!(error = %e, "heartbeat publish failed");
                }
            }
        }

        if missed >= HEARTBEAT_MISS_LIMIT {
            warn!(missed, "heartbeat watchdog forcing reconnect");
            let _ = inner.client.disconnect().await;
            missed = 0;
        }
    }
}
