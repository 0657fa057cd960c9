//! Movement pipeline scenarios: expansion laws, calibration rejection, and
//! the emergency stop against a recorded PWM backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tars::contracts::movement::{ChannelTarget, MovementDirective, MovementFrame, MovementStepSpec};
use tars::firmware::{PwmBackend, RecordingPwm, ServoController};
use tars::movement::{expand_directive, ServoCalibration};

fn controller_with(calibration: ServoCalibration) -> (Arc<ServoController>, Arc<RecordingPwm>) {
    let pwm = Arc::new(RecordingPwm::new());
    let controller = ServoController::new(Arc::clone(&pwm) as Arc<dyn PwmBackend>, calibration);
    (controller, pwm)
}

#[test]
fn expansion_round_trips_custom_step_targets() {
    let calibration = ServoCalibration::default();
    let directive = MovementDirective {
        name: "custom".into(),
        speed: None,
        sequence: Some(vec![
            MovementStepSpec {
                targets: vec![
                    ChannelTarget {
                        channel: 1,
                        percent: 75.0,
                    },
                    ChannelTarget {
                        channel: 2,
                        percent: 25.0,
                    },
                ],
                speed: 0.6,
                delay_after_s: 0.1,
            },
            MovementStepSpec {
                targets: vec![ChannelTarget {
                    channel: 1,
                    percent: 50.0,
                }],
                speed: 0.4,
                delay_after_s: 0.0,
            },
        ]),
    };

    let resolved = expand_directive(&directive, &calibration).unwrap();
    let spec_steps = directive.sequence.as_ref().unwrap();
    assert_eq!(resolved.len(), spec_steps.len());

    // Re-collect each step's target map; it must reproduce the original
    // step targets after the percent → pulse mapping.
    for (step, spec) in resolved.iter().zip(spec_steps) {
        let collected: Vec<(u8, u16)> = step.frames.iter().map(|(c, p, _)| (*c, *p)).collect();
        let expected: Vec<(u8, u16)> = spec
            .targets
            .iter()
            .map(|t| {
                (
                    t.channel,
                    calibration.percent_to_pulse(t.channel, t.percent).unwrap(),
                )
            })
            .collect();
        assert_eq!(collected, expected);
    }
}

#[tokio::test]
async fn frame_outside_calibration_is_rejected_before_pwm() {
    // Channel 5 capped at 280; a 380 pulse frame must never reach PWM.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    use std::io::Write as _;
    write!(
        file,
        r#"{{"channels": [{{"channel": 5, "min": 220, "neutral": 250, "max": 280}}]}}"#
    )
    .unwrap();
    let calibration = ServoCalibration::load(Some(file.path())).unwrap();
    let (controller, pwm) = controller_with(calibration);

    let frame = MovementFrame {
        channel: 5,
        pulse: 380,
        duration_ms: 20,
        ts: 0.0,
    };
    let err = controller.apply_frame(&frame).await.unwrap_err();
    assert!(err.to_string().contains("channel 5"));
    assert!(err.to_string().contains("380"));
    assert!(pwm.writes().is_empty());
}

#[tokio::test]
async fn emergency_stop_during_preset_floats_and_recovers() {
    let (controller, pwm) = controller_with(ServoCalibration::default());

    // Seat the channels first so the preset interpolates slowly.
    controller
        .move_multiple(&[(0, 300), (1, 310), (2, 310)], 1.0)
        .await
        .unwrap();

    let preset = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.execute_preset("step_forward").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.status().moving, "preset should be mid-travel");

    let begun = Instant::now();
    controller.emergency_stop_all().await;
    let elapsed = begun.elapsed();
    assert!(
        elapsed <= Duration::from_millis(150),
        "stop took {elapsed:?}"
    );

    let status = controller.status();
    assert!(status.emergency);
    assert!(status.positions.iter().all(|p| *p == 0), "{status:?}");
    for channel in 0..9 {
        assert_eq!(pwm.last_pulse(channel), Some(0), "channel {channel}");
    }

    // The interrupted preset surfaces a typed error, and a subsequent
    // movement command succeeds.
    assert!(preset.await.unwrap().is_err());
    controller.move_servo_smooth(0, 300, 1.0).await.unwrap();
    assert!(!controller.status().emergency);
}

#[tokio::test]
async fn preset_rejected_while_another_runs_then_accepted() {
    let (controller, _pwm) = controller_with(ServoCalibration::default());
    controller
        .move_multiple(&[(0, 300), (1, 310), (2, 310)], 1.0)
        .await
        .unwrap();

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.execute_preset("bow").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(controller.execute_preset("laugh").await.is_err());

    first.await.unwrap().unwrap();
    controller.execute_preset("laugh").await.unwrap();
}
