//! The servo controller: per-channel movement tasks, smooth interpolation,
//! preset execution, and the emergency-stop fast path.
//!
//! One async mutex per channel guarantees at most one movement task per
//! servo; the preset executor takes the same locks through `move_multiple`.
//! Every PWM write is validated against calibration first and retried on
//! bus errors before the channel is disabled.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::contracts::movement::{
    validate_channel, validate_speed, MovementFrame, MovementStatus, CHANNEL_COUNT,
};
use crate::contracts::EventPayload;
use crate::firmware::pwm::PwmBackend;
use crate::firmware::FirmwareError;
use crate::movement::calibration::ServoCalibration;
use crate::movement::presets::preset;

/// Per-unit interpolation delay at speed 0, seconds.
const UNIT_DELAY_AT_ZERO_SPEED_S: f64 = 0.02;
/// Nominal per-unit delay used to recover a speed from a frame's duration.
const UNIT_DELAY_FULL_MS: f64 = 20.0;
/// I²C write retries before a channel is disabled.
const WRITE_RETRIES: u32 = 3;
/// Backoff between I²C retries.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Emergency-stop budget: invocation to all-channels-floating.
const EMERGENCY_BUDGET: Duration = Duration::from_millis(100);

fn unit_delay(speed: f32) -> Duration {
    Duration::from_secs_f64(UNIT_DELAY_AT_ZERO_SPEED_S * f64::from(1.0 - speed))
}

/// Decrements the in-flight movement counter on every exit path.
struct MovingGuard<'a>(&'a AtomicUsize);

impl<'a> MovingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for MovingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears the preset-busy flag when the executor finishes or bails.
struct PresetGuard<'a>(&'a AtomicBool);

impl<'a> PresetGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Result<Self, FirmwareError> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FirmwareError::PresetBusy);
        }
        Ok(Self(flag))
    }
}

impl Drop for PresetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A channel taken out of service after repeated hardware failures.
///
/// The bus bridge consumes these and reports them on the movement state
/// topic and the retained controller health topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDisabled {
    pub channel: u8,
    pub reason: String,
}

/// The servo controller.
pub struct ServoController {
    pwm: Arc<dyn PwmBackend>,
    calibration: ServoCalibration,
    /// Execution locks, one per channel.
    locks: Vec<Arc<Mutex<()>>>,
    /// Last commanded pulse per channel; 0 means floating.
    positions: Vec<AtomicU16>,
    disabled: Vec<AtomicBool>,
    estop: AtomicBool,
    /// Latched "we floated everything" indicator for status reporting.
    emergency: AtomicBool,
    preset_busy: AtomicBool,
    moving: AtomicUsize,
    /// Set by the heap monitor; new movement commands are refused while on.
    memory_pressure: AtomicBool,
    /// Default speed for HTTP control requests, stored as f32 bits.
    default_speed: AtomicU32,
    /// Channel-disable notifications for the bus bridge.
    disable_tx: mpsc::UnboundedSender<ChannelDisabled>,
    disable_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ChannelDisabled>>>,
    started_at: Instant,
}

impl ServoController {
    pub fn new(pwm: Arc<dyn PwmBackend>, calibration: ServoCalibration) -> Arc<Self> {
        let n = usize::from(CHANNEL_COUNT);
        let (disable_tx, disable_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pwm,
            calibration,
            locks: (0..n).map(|_| Arc::new(Mutex::new(()))).collect(),
            positions: (0..n).map(|_| AtomicU16::new(0)).collect(),
            disabled: (0..n).map(|_| AtomicBool::new(false)).collect(),
            estop: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            preset_busy: AtomicBool::new(false),
            moving: AtomicUsize::new(0),
            memory_pressure: AtomicBool::new(false),
            default_speed: AtomicU32::new(0.5f32.to_bits()),
            disable_tx,
            disable_rx: std::sync::Mutex::new(Some(disable_rx)),
            started_at: Instant::now(),
        })
    }

    /// Take the disable-event receiver. Yields `Some` exactly once; the bus
    /// bridge owns the stream for the controller's lifetime.
    pub fn take_disable_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelDisabled>> {
        self.disable_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn calibration(&self) -> &ServoCalibration {
        &self.calibration
    }

    pub fn default_speed(&self) -> f32 {
        f32::from_bits(self.default_speed.load(Ordering::Relaxed))
    }

    /// Set the default speed used when HTTP control requests omit one.
    pub fn set_default_speed(&self, speed: f32) -> Result<(), FirmwareError> {
        validate_speed(speed)?;
        self.default_speed.store(speed.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Flip the memory-pressure refusal flag (driven by the heap monitor).
    pub fn set_memory_pressure(&self, on: bool) {
        if on != self.memory_pressure.swap(on, Ordering::SeqCst) {
            warn!(memory_pressure = on, "memory pressure flag changed");
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    pub fn is_memory_pressure(&self) -> bool {
        self.memory_pressure.load(Ordering::SeqCst)
    }

    /// Current aggregate status for the bus and the HTTP surface.
    pub fn status(&self) -> MovementStatus {
        MovementStatus {
            positions: self
                .positions
                .iter()
                .map(|p| p.load(Ordering::Relaxed))
                .collect(),
            moving: self.moving.load(Ordering::SeqCst) > 0,
            emergency: self.is_emergency(),
            disabled_channels: self
                .disabled
                .iter()
                .enumerate()
                .filter(|(_, d)| d.load(Ordering::Relaxed))
                .map(|(ch, _)| ch as u8)
                .collect(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn check_ready(&self, channel: u8) -> Result<(), FirmwareError> {
        validate_channel(channel)?;
        if self.memory_pressure.load(Ordering::SeqCst) {
            return Err(FirmwareError::MemoryPressure);
        }
        if self.disabled[usize::from(channel)].load(Ordering::Relaxed) {
            return Err(FirmwareError::ChannelDisabled(channel));
        }
        Ok(())
    }

    /// Write one pulse with retry; persistent failure disables the channel.
    async fn write_with_retry(&self, channel: u8, pulse: u16) -> Result<(), FirmwareError> {
        let mut last_reason = String::new();
        for attempt in 1..=WRITE_RETRIES {
            match self.pwm.set_pulse(channel, pulse).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_reason = e.reason;
                    if attempt < WRITE_RETRIES {
                        tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
                    }
                }
            }
        }
        self.disabled[usize::from(channel)].store(true, Ordering::Relaxed);
        error!(channel, reason = %last_reason, "channel disabled after repeated write failures");
        let _ = self.disable_tx.send(ChannelDisabled {
            channel,
            reason: last_reason.clone(),
        });
        Err(FirmwareError::Hardware {
            channel,
            reason: last_reason,
        })
    }

    /// Move one servo to `target` in 1-unit increments, re-checking the
    /// emergency-stop flag on every step.
    ///
    /// # Errors
    ///
    /// Validation failures never touch PWM. `Interrupted` means the
    /// emergency stop preempted the motion mid-travel.
    pub async fn move_servo_smooth(
        self: &Arc<Self>,
        channel: u8,
        target: u16,
        speed: f32,
    ) -> Result<(), FirmwareError> {
        self.check_ready(channel)?;
        validate_speed(speed)?;
        self.calibration.validate_pulse(channel, target)?;
        Arc::clone(self).move_one(channel, target, speed).await
    }

    async fn move_one(
        self: Arc<Self>,
        channel: u8,
        target: u16,
        speed: f32,
    ) -> Result<(), FirmwareError> {
        let lock = Arc::clone(&self.locks[usize::from(channel)]);
        let _guard = lock.lock().await;
        let _moving = MovingGuard::enter(&self.moving);

        let cal = self.calibration.channel(channel)?;
        let (min, max) = (cal.min, cal.max);
        let delay = unit_delay(speed);
        let mut current = self.positions[usize::from(channel)].load(Ordering::SeqCst);

        // Floating or untracked output: interpolating up from 0 would sweep
        // out-of-range pulses, so re-energize directly at the target.
        if current < min || current > max {
            if self.estop.load(Ordering::SeqCst) {
                return Err(FirmwareError::Interrupted);
            }
            self.write_with_retry(channel, target).await?;
            self.positions[usize::from(channel)].store(target, Ordering::SeqCst);
            self.emergency.store(false, Ordering::SeqCst);
            return Ok(());
        }

        while current != target {
            if self.estop.load(Ordering::SeqCst) {
                return Err(FirmwareError::Interrupted);
            }
            current = if current < target {
                current + 1
            } else {
                current - 1
            };
            self.write_with_retry(channel, current).await?;
            self.positions[usize::from(channel)].store(current, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.emergency.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Move several servos concurrently, one task per target, and wait for
    /// all of them. Travel times differ naturally; the first error is
    /// returned after every task has settled.
    pub async fn move_multiple(
        self: &Arc<Self>,
        targets: &[(u8, u16)],
        speed: f32,
    ) -> Result<(), FirmwareError> {
        validate_speed(speed)?;
        for (channel, pulse) in targets {
            self.check_ready(*channel)?;
            self.calibration.validate_pulse(*channel, *pulse)?;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for (channel, pulse) in targets {
            let ctl = Arc::clone(self);
            let (channel, pulse) = (*channel, *pulse);
            handles.push(tokio::spawn(ctl.move_one(channel, pulse, speed)));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(FirmwareError::Hardware {
                        channel: u8::MAX,
                        reason: format!("movement task panicked: {e}"),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run a named preset: each step's targets move concurrently, steps run
    /// sequentially, and every channel floats afterwards so the servos hold
    /// no torque.
    ///
    /// # Errors
    ///
    /// `PresetBusy` when another preset is running; `Interrupted` when the
    /// emergency stop preempts a step.
    pub async fn execute_preset(self: &Arc<Self>, name: &str) -> Result<(), FirmwareError> {
        if self.memory_pressure.load(Ordering::SeqCst) {
            return Err(FirmwareError::MemoryPressure);
        }
        let _busy = PresetGuard::try_acquire(&self.preset_busy)?;
        let steps =
            preset(name).ok_or_else(|| FirmwareError::UnknownPreset(name.to_owned()))?;
        info!(preset = name, steps = steps.len(), "preset started");

        for step in &steps {
            let mut targets = Vec::with_capacity(step.targets.len());
            for (channel, percent) in &step.targets {
                targets.push((*channel, self.calibration.percent_to_pulse(*channel, *percent)?));
            }
            self.move_multiple(&targets, step.speed).await?;
            if step.delay_after_s > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(step.delay_after_s)).await;
            }
        }

        self.float_all().await;
        info!(preset = name, "preset complete");
        Ok(())
    }

    /// Float every channel (PWM 0). Best effort, single write attempt each.
    async fn float_all(&self) {
        for channel in 0..CHANNEL_COUNT {
            if let Err(e) = self.pwm.set_pulse(channel, 0).await {
                warn!(channel, error = %e, "float write failed");
            }
            self.positions[usize::from(channel)].store(0, Ordering::SeqCst);
        }
    }

    /// Emergency stop: raise the flag, give in-flight tasks up to 100 ms to
    /// observe it, float all channels, clear the flag.
    pub async fn emergency_stop_all(&self) {
        warn!("emergency stop");
        self.estop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + EMERGENCY_BUDGET;
        while self.moving.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.float_all().await;
        self.estop.store(false, Ordering::SeqCst);
        self.emergency.store(true, Ordering::SeqCst);
    }

    /// Re-energize all channels at their calibrated neutral after an
    /// emergency stop.
    pub async fn resume(self: &Arc<Self>) -> Result<(), FirmwareError> {
        self.emergency.store(false, Ordering::SeqCst);
        let mut targets = Vec::with_capacity(usize::from(CHANNEL_COUNT));
        for channel in 0..CHANNEL_COUNT {
            if self.disabled[usize::from(channel)].load(Ordering::Relaxed) {
                continue;
            }
            targets.push((channel, self.calibration.neutral(channel)?));
        }
        self.move_multiple(&targets, 0.3).await
    }

    /// Apply a bus frame: validate, recover a speed from the frame's travel
    /// budget, then run the normal smooth move.
    pub async fn apply_frame(self: &Arc<Self>, frame: &MovementFrame) -> Result<(), FirmwareError> {
        frame.validate()?;
        self.calibration.validate_pulse(frame.channel, frame.pulse)?;
        let current = self.positions[usize::from(frame.channel)].load(Ordering::SeqCst);
        let distance = frame.pulse.abs_diff(current);
        let speed = if frame.duration_ms == 0 || distance == 0 {
            1.0
        } else {
            let per_unit_ms = f64::from(frame.duration_ms) / f64::from(distance);
            (1.0 - (per_unit_ms / UNIT_DELAY_FULL_MS) as f32).clamp(0.1, 1.0)
        };
        self.move_servo_smooth(frame.channel, frame.pulse, speed)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::pwm::RecordingPwm;

    fn controller() -> (Arc<ServoController>, Arc<RecordingPwm>) {
        let pwm = Arc::new(RecordingPwm::new());
        let ctl = ServoController::new(
            Arc::clone(&pwm) as Arc<dyn PwmBackend>,
            ServoCalibration::default(),
        );
        (ctl, pwm)
    }

    #[tokio::test]
    async fn out_of_range_pulse_never_reaches_pwm() {
        let (ctl, pwm) = controller();
        let max = ctl.calibration().channel(5).unwrap().max;
        let err = ctl.move_servo_smooth(5, max + 50, 1.0).await.unwrap_err();
        assert!(matches!(err, FirmwareError::Movement(_)), "{err}");
        assert!(pwm.writes().is_empty());
    }

    #[tokio::test]
    async fn invalid_channel_and_speed_rejected() {
        let (ctl, pwm) = controller();
        assert!(ctl.move_servo_smooth(9, 300, 0.5).await.is_err());
        assert!(ctl.move_servo_smooth(0, 300, 0.01).await.is_err());
        assert!(pwm.writes().is_empty());
    }

    #[tokio::test]
    async fn floating_channel_snaps_then_interpolates() {
        let (ctl, pwm) = controller();
        // First move from floating: single direct write.
        ctl.move_servo_smooth(0, 300, 1.0).await.unwrap();
        assert_eq!(pwm.writes(), vec![(0, 300)]);
        // Second move interpolates in 1-unit steps.
        ctl.move_servo_smooth(0, 305, 1.0).await.unwrap();
        let writes = pwm.writes();
        assert_eq!(&writes[1..], &[(0, 301), (0, 302), (0, 303), (0, 304), (0, 305)]);
    }

    #[tokio::test]
    async fn move_multiple_settles_every_channel() {
        let (ctl, pwm) = controller();
        ctl.move_multiple(&[(0, 300), (1, 310), (2, 310)], 1.0)
            .await
            .unwrap();
        assert_eq!(pwm.last_pulse(0), Some(300));
        assert_eq!(pwm.last_pulse(1), Some(310));
        assert_eq!(pwm.last_pulse(2), Some(310));
    }

    #[tokio::test]
    async fn preset_floats_all_channels_on_completion() {
        let (ctl, pwm) = controller();
        ctl.execute_preset("laugh").await.unwrap();
        for channel in 0..CHANNEL_COUNT {
            assert_eq!(pwm.last_pulse(channel), Some(0), "channel {channel}");
        }
        assert!(!ctl.status().moving);
    }

    #[tokio::test]
    async fn second_preset_is_busy() {
        let (ctl, _pwm) = controller();
        let first = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.execute_preset("bow").await })
        };
        // Give the first preset time to claim the executor.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = ctl.execute_preset("laugh").await.unwrap_err();
        assert!(matches!(err, FirmwareError::PresetBusy));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn emergency_stop_floats_within_budget() {
        let (ctl, pwm) = controller();
        // Seat a channel, then start a long slow move to interrupt.
        ctl.move_servo_smooth(1, 250, 1.0).await.unwrap();
        let mover = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.move_servo_smooth(1, 440, 0.1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let begun = Instant::now();
        ctl.emergency_stop_all().await;
        assert!(begun.elapsed() <= Duration::from_millis(150), "{:?}", begun.elapsed());

        let status = ctl.status();
        assert!(status.emergency);
        assert!(status.positions.iter().all(|p| *p == 0));
        assert!(matches!(
            mover.await.unwrap().unwrap_err(),
            FirmwareError::Interrupted
        ));

        // A subsequent movement succeeds (no latch on the bus path).
        ctl.move_servo_smooth(1, 250, 1.0).await.unwrap();
        assert!(!ctl.status().emergency);
        assert_eq!(pwm.last_pulse(1), Some(250));
    }

    #[tokio::test]
    async fn failing_channel_is_disabled_after_retries() {
        tokio::time::pause();
        let (ctl, pwm) = controller();
        let mut disable_rx = ctl.take_disable_events().unwrap();
        pwm.fail_channel(4);
        let moved = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.move_servo_smooth(4, 300, 1.0).await })
        };
        // Two retry backoffs of 100 ms run under the paused clock.
        let err = moved.await.unwrap().unwrap_err();
        assert!(matches!(err, FirmwareError::Hardware { channel: 4, .. }));
        assert_eq!(ctl.status().disabled_channels, vec![4]);
        // The disable is announced for the bus bridge to report.
        let event = disable_rx.recv().await.unwrap();
        assert_eq!(event.channel, 4);
        assert!(!event.reason.is_empty());
        // Further commands to the disabled channel fail fast.
        assert!(matches!(
            ctl.move_servo_smooth(4, 300, 1.0).await.unwrap_err(),
            FirmwareError::ChannelDisabled(4)
        ));
        // The receiver can only be taken once.
        assert!(ctl.take_disable_events().is_none());
    }

    #[tokio::test]
    async fn memory_pressure_refuses_new_commands() {
        let (ctl, pwm) = controller();
        ctl.set_memory_pressure(true);
        assert!(matches!(
            ctl.move_servo_smooth(0, 300, 0.5).await.unwrap_err(),
            FirmwareError::MemoryPressure
        ));
        assert!(matches!(
            ctl.execute_preset("laugh").await.unwrap_err(),
            FirmwareError::MemoryPressure
        ));
        assert!(pwm.writes().is_empty());
        ctl.set_memory_pressure(false);
        assert!(ctl.move_servo_smooth(0, 300, 0.5).await.is_ok());
    }

    #[tokio::test]
    async fn frame_application_recovers_speed_from_duration() {
        let (ctl, pwm) = controller();
        ctl.move_servo_smooth(2, 300, 1.0).await.unwrap();
        let frame = MovementFrame {
            channel: 2,
            pulse: 310,
            duration_ms: 0,
            ts: 0.0,
        };
        ctl.apply_frame(&frame).await.unwrap();
        assert_eq!(pwm.last_pulse(2), Some(310));
    }

    #[tokio::test]
    async fn rejected_frame_names_channel_and_value() {
        // Frame against a calibration where channel 5 tops out at 280.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(
            file,
            r#"{{"channels": [{{"channel": 5, "min": 220, "neutral": 250, "max": 280}}]}}"#
        )
        .unwrap();
        let calibration = ServoCalibration::load(Some(file.path())).unwrap();
        let pwm = Arc::new(RecordingPwm::new());
        let ctl = ServoController::new(Arc::clone(&pwm) as Arc<dyn PwmBackend>, calibration);

        let frame = MovementFrame {
            channel: 5,
            pulse: 380,
            duration_ms: 20,
            ts: 0.0,
        };
        let err = ctl.apply_frame(&frame).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("channel 5"), "{text}");
        assert!(text.contains("380"), "{text}");
        assert!(pwm.writes().is_empty(), "PWM must not be written");
    }
}
