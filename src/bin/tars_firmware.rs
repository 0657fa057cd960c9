//! Servo-controller firmware binary: frames and emergency stop from the
//! bus, plus the local HTTP control surface.
//!
//! The PWM backend defaults to the logging stand-in; the PCA9685 I²C
//! backend is supplied by the embedded build.

use std::sync::Arc;

use tars::firmware::{
    DebugPwm, FirmwareBridge, HeapMonitor, HttpSurface, PwmBackend, ServoController,
};
use tars::movement::ServoCalibration;
use tars::service::{init_tracing, run_service};
use tars::FirmwareConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("tars-firmware starting");

    let firmware_config = FirmwareConfig::from_env()?;
    let calibration = ServoCalibration::load(firmware_config.calibration_path.as_deref())?;

    run_service(|client, cancel| async move {
        let pwm = Arc::new(DebugPwm) as Arc<dyn PwmBackend>;
        let controller = ServoController::new(pwm, calibration);
        let bridge = FirmwareBridge::new(client, Arc::clone(&controller));
        let surface = HttpSurface::with_bridge(Arc::clone(&controller), Arc::clone(&bridge));

        let heap = {
            let monitor = HeapMonitor::new(
                Arc::clone(&controller),
                firmware_config.heap_floor_kb,
                cancel.clone(),
            );
            tokio::spawn(monitor.run())
        };
        let http = {
            let cancel = cancel.clone();
            let port = firmware_config.http_port;
            tokio::spawn(async move { surface.serve(port, cancel).await })
        };
        let result = bridge.run(cancel).await;
        let _ = http.await;
        let _ = heap.await;
        result
    })
    .await?;

    tracing::info!("tars-firmware shut down cleanly");
    Ok(())
}
