//! Bus side of the firmware: consumes `movement/frame` and `movement/stop`,
//! reports `movement/status` ticks, `movement/state` transitions around the
//! emergency path, and channel disables on the retained controller health
//! topic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::contracts::movement::{MovementPhase, MovementState};
use crate::contracts::system::HealthStatus;
use crate::contracts::{topics, Correlation, DomainEvent};
use crate::error::Result;
use crate::firmware::servo::ChannelDisabled;
use crate::firmware::ServoController;
use crate::mqtt::{handler, MqttClient};

/// Cadence of `movement/status` reports.
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

/// Service segment of the controller's retained health topic.
const HEALTH_SERVICE: &str = "movement-controller";

/// Connects a [`ServoController`] to the broker.
pub struct FirmwareBridge {
    client: MqttClient,
    controller: Arc<ServoController>,
}

impl FirmwareBridge {
    pub fn new(client: MqttClient, controller: Arc<ServoController>) -> Arc<Self> {
        Arc::new(Self { client, controller })
    }

    /// Subscribe to the frame and stop topics, then report status and
    /// channel disables until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        {
            let bridge = Arc::clone(&self);
            self.client
                .subscribe(
                    topics::MOVEMENT_FRAME,
                    handler(move |inbound| {
                        let bridge = Arc::clone(&bridge);
                        async move {
                            if let DomainEvent::MovementFrame(frame) = inbound.event {
                                if let Err(e) = bridge.controller.apply_frame(&frame).await {
                                    error!(
                                        channel = frame.channel,
                                        pulse = frame.pulse,
                                        error = %e,
                                        "frame rejected"
                                    );
                                }
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }
        {
            let bridge = Arc::clone(&self);
            self.client
                .subscribe(
                    topics::MOVEMENT_STOP,
                    handler(move |inbound| {
                        let bridge = Arc::clone(&bridge);
                        async move {
                            if let DomainEvent::MovementStop(stop) = inbound.event {
                                info!(reason = stop.reason.as_deref(), "bus emergency stop");
                                bridge.emergency_stop().await;
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }
        info!("firmware bridge ready");

        let mut disable_rx = self.controller.take_disable_events();
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let status = self.controller.status();
                    if let Err(e) = self
                        .client
                        .publish_event(topics::MOVEMENT_STATUS, Correlation::none(), status)
                        .await
                    {
                        error!(error = %e, "status publish failed");
                    }
                }
                disabled = recv_disable(&mut disable_rx) => {
                    self.report_channel_disabled(disabled).await;
                }
            }
        }
        Ok(())
    }

    /// Run the emergency stop and report the `executing → idle` transition
    /// with the failure cause.
    pub async fn emergency_stop(&self) {
        let was_moving = self.controller.status().moving;
        self.controller.emergency_stop_all().await;
        if was_moving {
            let state = MovementState {
                state: MovementPhase::Idle,
                directive: None,
                failure: Some("emergency_stop".to_owned()),
            };
            if let Err(e) = self
                .client
                .publish_event(topics::MOVEMENT_STATE, Correlation::none(), state)
                .await
            {
                error!(error = %e, "state publish failed after emergency stop");
            }
        }
    }

    /// A channel was taken out of service after repeated hardware errors.
    /// Surfaces it as a `movement/state` failure and flips the controller's
    /// retained health value.
    async fn report_channel_disabled(&self, event: ChannelDisabled) {
        warn!(channel = event.channel, reason = %event.reason, "reporting disabled channel");
        let failure = format!("channel {} disabled: {}", event.channel, event.reason);

        let state = MovementState {
            state: MovementPhase::Idle,
            directive: None,
            failure: Some(failure.clone()),
        };
        if let Err(e) = self
            .client
            .publish_event(topics::MOVEMENT_STATE, Correlation::none(), state)
            .await
        {
            error!(error = %e, "state publish failed for disabled channel");
        }

        let health_topic = topics::health_topic(HEALTH_SERVICE);
        if let Err(e) = self
            .client
            .publish_event(&health_topic, Correlation::none(), HealthStatus::failed(failure))
            .await
        {
            error!(error = %e, "health publish failed for disabled channel");
        }
    }
}

/// Wait for a disable event; pends forever once the stream is gone (or was
/// already taken by another owner).
async fn recv_disable(rx: &mut Option<mpsc::UnboundedReceiver<ChannelDisabled>>) -> ChannelDisabled {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
