//! The common service skeleton: tracing setup, env config, shared client
//! lifecycle, signal handling, and graceful shutdown.
//!
//! Every binary is the same thin shape: `init_tracing()`, then
//! `run_service(...)` with the service body. A fatal body error cancels the
//! token (aborting sibling tasks) and still runs the client shutdown
//! sequence, so the retained health value stays truthful.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::MqttConfig;
use crate::error::Result;
use crate::mqtt::MqttClient;

/// Initialise tracing from `RUST_LOG`, falling back to `LOG_LEVEL`, then
/// `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL").map_or_else(
                |_| EnvFilter::try_new("info"),
                |level| EnvFilter::try_new(level),
            )
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "sigterm handler install failed");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Connect the shared client, run `body` until it finishes or a signal
/// arrives, then shut the client down.
///
/// The client publishes retained health `ready` on connect and `shutdown`
/// on the way out; a crash in between leaves the Last-Will.
///
/// # Errors
///
/// Config and connect failures surface before `body` runs; otherwise the
/// body's own result is returned after shutdown completes.
pub async fn run_service<F, Fut>(body: F) -> Result<()>
where
    F: FnOnce(MqttClient, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let config = MqttConfig::from_env()?;
    let service = config.source_name.clone();
    let client = MqttClient::new(config);
    client.connect().await?;
    info!(service = %service, "service connected");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let result = body(client.clone(), cancel.clone()).await;
    if let Err(e) = &result {
        error!(service = %service, error = %e, "service body failed");
        cancel.cancel();
    }

    client.shutdown().await;
    info!(service = %service, "service stopped");
    result
}
