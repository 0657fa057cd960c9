//! The movement service: consumes `movement/command`, expands directives
//! into calibrated PWM frames, and publishes them for the firmware.
//!
//! Exactly one sequence runs at a time; a directive arriving mid-sequence is
//! rejected with a busy error. `movement/stop` preempts the active sequence
//! immediately (the firmware performs the actual emergency stop on the same
//! message; the host just stops feeding frames and reports the failure).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MovementConfig;
use crate::contracts::envelope::now_unix;
use crate::contracts::movement::{
    MovementDirective, MovementFrame, MovementPhase, MovementState, MovementTest,
};
use crate::contracts::system::HealthStatus;
use crate::contracts::{topics, Correlation, DomainEvent, EventPayload};
use crate::error::Result;
use crate::movement::calibration::ServoCalibration;
use crate::movement::presets::{preset, PresetStep};
use crate::movement::MovementError;
use crate::mqtt::{handler, MqttClient};

/// Per-unit interpolation delay at speed 0, seconds. Matches the firmware's
/// smooth-move loop, so host-computed durations line up with actual travel.
const UNIT_DELAY_AT_ZERO_SPEED_S: f64 = 0.02;

/// One expanded step: absolute pulse targets plus timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    /// `(channel, pulse, duration_ms)` per target.
    pub frames: Vec<(u8, u16, u32)>,
    pub delay_after: Duration,
    /// Longest single-frame travel time in the step.
    pub travel: Duration,
}

/// Travel time for moving `distance` pulse units at `speed`.
fn travel_ms(distance: u16, speed: f32) -> u32 {
    let per_unit = UNIT_DELAY_AT_ZERO_SPEED_S * f64::from(1.0 - speed);
    (per_unit * f64::from(distance) * 1000.0).round() as u32
}

/// Expand a directive into calibrated frame steps.
///
/// Tracks the last commanded pulse per channel (starting from neutral) so
/// each frame's duration reflects its actual travel distance.
///
/// # Errors
///
/// Unknown preset names, invalid custom sequences, and calibration
/// violations are rejected before any frame is produced.
pub fn expand_directive(
    directive: &MovementDirective,
    calibration: &ServoCalibration,
) -> std::result::Result<Vec<ResolvedStep>, MovementError> {
    directive.validate()?;

    let steps: Vec<PresetStep> = if directive.name == "custom" {
        directive
            .sequence
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|s| PresetStep {
                targets: s.targets.iter().map(|t| (t.channel, t.percent)).collect(),
                speed: s.speed,
                delay_after_s: s.delay_after_s,
            })
            .collect()
    } else {
        preset(&directive.name)
            .ok_or_else(|| MovementError::UnknownPreset(directive.name.clone()))?
    };

    let mut last_pulse: Vec<u16> = (0..calibration.channel_count())
        .map(|ch| calibration.neutral(ch))
        .collect::<std::result::Result<_, _>>()?;

    let mut resolved = Vec::with_capacity(steps.len());
    for step in &steps {
        let speed = directive.speed.unwrap_or(step.speed);
        let mut frames = Vec::with_capacity(step.targets.len());
        let mut travel = Duration::ZERO;
        for (channel, percent) in &step.targets {
            let pulse = calibration.percent_to_pulse(*channel, *percent)?;
            calibration.validate_pulse(*channel, pulse)?;
            let distance = pulse.abs_diff(last_pulse[*channel as usize]);
            let duration_ms = travel_ms(distance, speed);
            travel = travel.max(Duration::from_millis(u64::from(duration_ms)));
            last_pulse[*channel as usize] = pulse;
            frames.push((*channel, pulse, duration_ms));
        }
        resolved.push(ResolvedStep {
            frames,
            delay_after: Duration::from_secs_f64(step.delay_after_s),
            travel,
        });
    }
    Ok(resolved)
}

struct ActiveRun {
    name: String,
    cancel: CancellationToken,
}

/// The movement service.
pub struct MovementService {
    client: MqttClient,
    config: MovementConfig,
    calibration: ServoCalibration,
    active: Mutex<Option<ActiveRun>>,
}

impl MovementService {
    /// Build the service, loading the calibration override if configured.
    ///
    /// # Errors
    ///
    /// Propagates calibration-file failures (fatal at startup).
    pub fn new(client: MqttClient, config: MovementConfig) -> Result<Arc<Self>> {
        let calibration = ServoCalibration::load(config.calibration_path.as_deref())?;
        Ok(Arc::new(Self {
            client,
            config,
            calibration,
            active: Mutex::new(None),
        }))
    }

    /// Subscribe to command/test/stop topics and idle until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        {
            let service = Arc::clone(&self);
            self.client
                .subscribe(
                    &self.config.command_topic,
                    handler(move |inbound| {
                        let service = Arc::clone(&service);
                        async move {
                            if let DomainEvent::MovementCommand(directive) = inbound.event {
                                service.handle_directive(directive).await;
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }
        {
            let service = Arc::clone(&self);
            self.client
                .subscribe(
                    topics::MOVEMENT_TEST,
                    handler(move |inbound| {
                        let service = Arc::clone(&service);
                        async move {
                            if let DomainEvent::MovementTest(test) = inbound.event {
                                service.handle_test(test).await;
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }
        {
            let service = Arc::clone(&self);
            self.client
                .subscribe(
                    topics::MOVEMENT_STOP,
                    handler(move |inbound| {
                        let service = Arc::clone(&service);
                        async move {
                            if let DomainEvent::MovementStop(stop) = inbound.event {
                                service.handle_stop(stop.reason).await;
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }

        self.publish_state(MovementPhase::Idle, None, None).await;
        info!("movement service ready");
        cancel.cancelled().await;

        // Preempt any in-flight sequence before going down.
        self.handle_stop(Some("service shutdown".to_owned())).await;
        Ok(())
    }

    async fn handle_directive(self: &Arc<Self>, directive: MovementDirective) {
        let expanded = match expand_directive(&directive, &self.calibration) {
            Ok(steps) => steps,
            Err(e) => {
                error!(directive = %directive.name, error = %e, "directive rejected");
                return;
            }
        };

        let run_cancel = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = active.as_ref() {
                // Domain equivalent of HTTP 409: one sequence at a time.
                warn!(
                    active = %run.name,
                    rejected = %directive.name,
                    "busy, directive rejected"
                );
                return;
            }
            let cancel = CancellationToken::new();
            *active = Some(ActiveRun {
                name: directive.name.clone(),
                cancel: cancel.clone(),
            });
            cancel
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.execute(directive.name, expanded, run_cancel).await;
        });
    }

    async fn handle_test(self: &Arc<Self>, test: MovementTest) {
        // Smoke sequence: a gentle neutral sweep, optionally one channel.
        let directive = match test.channel {
            Some(channel) => MovementDirective {
                name: "custom".to_owned(),
                speed: Some(0.3),
                sequence: Some(vec![
                    crate::contracts::movement::MovementStepSpec {
                        targets: vec![crate::contracts::movement::ChannelTarget {
                            channel,
                            percent: 60.0,
                        }],
                        speed: 0.3,
                        delay_after_s: 0.2,
                    },
                    crate::contracts::movement::MovementStepSpec {
                        targets: vec![crate::contracts::movement::ChannelTarget {
                            channel,
                            percent: 50.0,
                        }],
                        speed: 0.3,
                        delay_after_s: 0.0,
                    },
                ]),
            },
            None => MovementDirective {
                name: "reset_positions".to_owned(),
                speed: Some(0.3),
                sequence: None,
            },
        };
        self.handle_directive(directive).await;
    }

    async fn handle_stop(&self, reason: Option<String>) {
        let run = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(run) = run {
            warn!(active = %run.name, reason = reason.as_deref(), "stopping active sequence");
            run.cancel.cancel();
            self.publish_state(
                MovementPhase::Idle,
                Some(run.name),
                Some("emergency_stop".to_owned()),
            )
            .await;
        }
    }

    async fn execute(
        self: Arc<Self>,
        name: String,
        steps: Vec<ResolvedStep>,
        run_cancel: CancellationToken,
    ) {
        info!(directive = %name, steps = steps.len(), "sequence started");
        self.publish_state(MovementPhase::Executing, Some(name.clone()), None)
            .await;

        let mut preempted = false;
        'steps: for step in &steps {
            for (channel, pulse, duration_ms) in &step.frames {
                if run_cancel.is_cancelled() {
                    preempted = true;
                    break 'steps;
                }
                let frame = MovementFrame {
                    channel: *channel,
                    pulse: *pulse,
                    duration_ms: *duration_ms,
                    ts: now_unix(),
                };
                if let Err(e) = self
                    .client
                    .publish_event(&self.config.frame_topic, Correlation::none(), frame)
                    .await
                {
                    error!(error = %e, "frame publish failed, aborting sequence");
                    self.publish_failure_health("frame publish failed").await;
                    preempted = true;
                    break 'steps;
                }
            }
            // Let the firmware finish the step's travel before the next one.
            let pause = step.travel + step.delay_after;
            tokio::select! {
                () = run_cancel.cancelled() => {
                    preempted = true;
                    break 'steps;
                }
                () = tokio::time::sleep(pause) => {}
            }
        }

        if preempted {
            // handle_stop already reported the failure state.
            info!(directive = %name, "sequence preempted");
            return;
        }

        self.publish_state(MovementPhase::CoolingDown, Some(name.clone()), None)
            .await;
        tokio::time::sleep(self.config.cooldown).await;

        self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.publish_state(MovementPhase::Idle, Some(name.clone()), None)
            .await;
        info!(directive = %name, "sequence complete");
    }

    async fn publish_state(
        &self,
        phase: MovementPhase,
        directive: Option<String>,
        failure: Option<String>,
    ) {
        let state = MovementState {
            state: phase,
            directive,
            failure,
        };
        if let Err(e) = self
            .client
            .publish_event(&self.config.state_topic, Correlation::none(), state)
            .await
        {
            error!(error = %e, "state publish failed");
        }
    }

    /// Flip the movement health topic to a failed state. Best effort; the
    /// retained value recovers on the next clean startup.
    async fn publish_failure_health(&self, reason: &str) {
        let topic = topics::health_topic(&self.config.health_service);
        if let Err(e) = self
            .client
            .publish_event(&topic, Correlation::none(), HealthStatus::failed(reason))
            .await
        {
            error!(error = %e, "failure health publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::movement::{ChannelTarget, MovementStepSpec};

    fn custom(steps: Vec<MovementStepSpec>) -> MovementDirective {
        MovementDirective {
            name: "custom".to_owned(),
            speed: None,
            sequence: Some(steps),
        }
    }

    #[test]
    fn expansion_reproduces_step_targets() {
        let calibration = ServoCalibration::default();
        let directive = custom(vec![
            MovementStepSpec {
                targets: vec![
                    ChannelTarget {
                        channel: 0,
                        percent: 80.0,
                    },
                    ChannelTarget {
                        channel: 1,
                        percent: 20.0,
                    },
                ],
                speed: 0.5,
                delay_after_s: 0.1,
            },
            MovementStepSpec {
                targets: vec![ChannelTarget {
                    channel: 0,
                    percent: 50.0,
                }],
                speed: 0.5,
                delay_after_s: 0.0,
            },
        ]);
        let steps = expand_directive(&directive, &calibration).unwrap();
        assert_eq!(steps.len(), 2);

        // Re-collect the per-step target map and compare against the source.
        let spec_steps = directive.sequence.as_ref().unwrap();
        for (resolved, spec) in steps.iter().zip(spec_steps) {
            assert_eq!(resolved.frames.len(), spec.targets.len());
            for ((channel, pulse, _), target) in resolved.frames.iter().zip(&spec.targets) {
                assert_eq!(*channel, target.channel);
                assert_eq!(
                    *pulse,
                    calibration
                        .percent_to_pulse(target.channel, target.percent)
                        .unwrap()
                );
            }
        }
    }

    #[test]
    fn every_preset_expands_within_calibration() {
        let calibration = ServoCalibration::default();
        for name in crate::movement::PRESET_NAMES {
            let directive = MovementDirective {
                name: (*name).to_owned(),
                speed: None,
                sequence: None,
            };
            let steps = expand_directive(&directive, &calibration)
                .unwrap_or_else(|e| panic!("{name}: {e}"));
            for step in steps {
                for (channel, pulse, _) in step.frames {
                    calibration
                        .validate_pulse(channel, pulse)
                        .unwrap_or_else(|e| panic!("{name}: {e}"));
                }
            }
        }
    }

    #[test]
    fn unknown_preset_rejected() {
        let calibration = ServoCalibration::default();
        let directive = MovementDirective {
            name: "moonwalk".to_owned(),
            speed: None,
            sequence: None,
        };
        assert!(matches!(
            expand_directive(&directive, &calibration),
            Err(MovementError::UnknownPreset(_))
        ));
    }

    #[test]
    fn speed_override_applies_to_every_step() {
        let calibration = ServoCalibration::default();
        let slow = MovementDirective {
            name: "laugh".to_owned(),
            speed: Some(0.1),
            sequence: None,
        };
        let fast = MovementDirective {
            name: "laugh".to_owned(),
            speed: Some(1.0),
            sequence: None,
        };
        let slow_steps = expand_directive(&slow, &calibration).unwrap();
        let fast_steps = expand_directive(&fast, &calibration).unwrap();
        // Full speed means no interpolation delay at all.
        assert!(fast_steps.iter().all(|s| s.travel == Duration::ZERO));
        assert!(slow_steps.iter().any(|s| s.travel > Duration::ZERO));
    }

    #[test]
    fn travel_time_scales_with_distance_and_speed() {
        assert_eq!(travel_ms(0, 0.5), 0);
        assert_eq!(travel_ms(100, 1.0), 0);
        let slow = travel_ms(100, 0.1);
        let fast = travel_ms(100, 0.9);
        assert!(slow > fast);
        // 100 units at speed 0.1: 0.02 * 0.9 * 100 = 1.8 s.
        assert_eq!(slow, 1800);
    }
}
