//! Free-memory watchdog for the movement-refusal flag.
//!
//! [`HeapMonitor`] polls available memory at a fixed cadence and flips the
//! controller's memory-pressure flag when the free amount drops below the
//! configured floor. New movement commands are refused while the flag is
//! set; the flag clears itself once memory recovers.
//!
//! Only transitions are logged, not every sample under pressure.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::firmware::ServoController;

/// Poll interval in seconds.
const POLL_INTERVAL_SECS: u64 = 5;

/// Monitors free memory and drives [`ServoController::set_memory_pressure`].
pub struct HeapMonitor {
    controller: Arc<ServoController>,
    /// Refuse movement below this much free memory, in kilobytes.
    floor_kb: u64,
    cancel: CancellationToken,
    poll_interval_secs: u64,
}

impl HeapMonitor {
    pub fn new(controller: Arc<ServoController>, floor_kb: u64, cancel: CancellationToken) -> Self {
        Self {
            controller,
            floor_kb,
            cancel,
            poll_interval_secs: POLL_INTERVAL_SECS,
        }
    }

    /// Override the poll interval (useful for testing).
    #[cfg(test)]
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Run the monitor until the cancellation token is cancelled.
    pub async fn run(self) {
        let Some(initial) = free_memory_kb() else {
            // No probe on this platform; the flag stays wherever operators
            // set it and movement is never refused autonomously.
            warn!("free-memory probe unavailable, heap monitor idle");
            return;
        };
        info!(
            free_kb = initial,
            floor_kb = self.floor_kb,
            "heap monitor started"
        );

        let mut pressured = false;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("heap monitor stopped");
                    break;
                }
                () = tokio::time::sleep(std::time::Duration::from_secs(self.poll_interval_secs)) => {
                    let Some(free_kb) = free_memory_kb() else {
                        continue;
                    };
                    let now_pressured = free_kb < self.floor_kb;
                    if now_pressured != pressured {
                        if now_pressured {
                            warn!(
                                free_kb,
                                floor_kb = self.floor_kb,
                                "free memory below floor, refusing movement commands"
                            );
                        } else {
                            info!(free_kb, "free memory recovered, movement re-enabled");
                        }
                        self.controller.set_memory_pressure(now_pressured);
                        pressured = now_pressured;
                    }
                }
            }
        }
    }
}

/// Free memory in kilobytes, when the platform exposes it.
///
/// Linux: `/proc/meminfo` `MemAvailable`. Other platforms: `None`.
fn free_memory_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let text = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available(&text)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Parse the `MemAvailable` line (kB) out of a meminfo dump.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mem_available(text: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::pwm::{PwmBackend, RecordingPwm};
    use crate::movement::ServoCalibration;

    const MEMINFO: &str = "MemTotal:       16384000 kB\n\
MemFree:         1024000 kB\n\
MemAvailable:    8192000 kB\n\
Buffers:          204800 kB\n";

    #[test]
    fn parses_mem_available() {
        assert_eq!(parse_mem_available(MEMINFO), Some(8_192_000));
    }

    #[test]
    fn missing_line_is_none() {
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_mem_available(""), None);
    }

    #[test]
    fn garbled_value_is_none() {
        assert_eq!(parse_mem_available("MemAvailable: lots kB\n"), None);
    }

    #[tokio::test]
    async fn monitor_stops_on_cancel() {
        let pwm = Arc::new(RecordingPwm::new());
        let controller =
            ServoController::new(pwm as Arc<dyn PwmBackend>, ServoCalibration::default());
        let cancel = CancellationToken::new();
        let monitor = HeapMonitor::new(Arc::clone(&controller), 150, cancel.clone())
            .with_poll_interval_secs(1);
        let handle = tokio::spawn(monitor.run());
        cancel.cancel();
        handle.await.unwrap();
        // A sane floor never trips pressure on a healthy host.
        assert!(!controller.is_memory_pressure());
    }
}
