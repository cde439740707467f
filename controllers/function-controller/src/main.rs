//! Function Controller
//!
//! Watches Kubeless `Function` resources in one namespace and keeps one
//! worker running per function:
//! - Registers the `functions.kubeless.io` resource type at startup
//! - Lists existing functions, then follows the watch stream from the list cursor
//! - Relists and resyncs when the API server reports the cursor as expired
//! - Stops every worker and waits for it on SIGTERM / Ctrl-C

mod backoff;
mod config;
mod controller;
mod decoder;
mod error;
mod probes;
mod reconciler;
mod snapshot;
mod state;
#[cfg(test)]
mod test_utils;
mod watcher;
mod worker;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::worker::LoggingRuntime;
use apiserver_client::{ApiServerClient, ApiServerClientTrait};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Function Controller");

    // Load configuration from environment variables
    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  API server: {}", config.api_url);
    info!("  Namespace: {}", config.namespace);
    info!("  Probe address: {}", config.probe_addr);

    let client = ApiServerClient::new(
        config.api_url.clone(),
        config.resolve_token()?,
        config.resolve_ca()?,
    )?;
    let client: Arc<dyn ApiServerClientTrait> = Arc::new(client);

    let controller = Controller::new(
        client,
        Arc::new(LoggingRuntime),
        config.controller_settings(),
    );
    let shutdown = controller.shutdown_token();

    // Probes stay up until the controller has fully stopped
    let probe_shutdown = CancellationToken::new();
    let probe_server = tokio::spawn(probes::serve(
        config.probe_addr,
        controller.probe_state(),
        probe_shutdown.clone(),
    ));
    tokio::spawn(shutdown_on_signal(shutdown));

    let result = controller.run().await;

    probe_shutdown.cancel();
    match probe_server.await {
        Ok(Err(e)) => error!("Probe server failed: {}", e),
        Err(e) => error!("Probe server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    result
}

/// Cancel `shutdown` on Ctrl-C or (on unix) SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
