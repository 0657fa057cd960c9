//! Movement service binary: expands directives into calibrated frames.

use tars::movement::MovementService;
use tars::service::{init_tracing, run_service};
use tars::MovementConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("tars-movement starting");

    let movement_config = MovementConfig::from_env()?;
    run_service(|client, cancel| async move {
        let service = MovementService::new(client, movement_config)?;
        service.run(cancel).await
    })
    .await?;

    tracing::info!("tars-movement shut down cleanly");
    Ok(())
}
