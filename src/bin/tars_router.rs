//! Conversation router service binary.

use tars::router::RouterService;
use tars::service::{init_tracing, run_service};
use tars::RouterConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("tars-router starting");

    let router_config = RouterConfig::from_env()?;
    run_service(|client, cancel| async move {
        RouterService::new(client, router_config).run(cancel).await
    })
    .await?;

    tracing::info!("tars-router shut down cleanly");
    Ok(())
}
