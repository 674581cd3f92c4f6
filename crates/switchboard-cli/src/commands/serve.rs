//! Serve command - run the gateway until interrupted.

use anyhow::Result;
use switchboard_core::config::Config;

use crate::ui;

/// Run the gateway with an already loaded config.
pub async fn run_serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.gateway.port = port;
        config.validate()?;
    }

    ui::header("Starting Switchboard Gateway");
    ui::kv("Address", &config.gateway.bind_address());
    ui::kv("Tenants", &config.tenants.len().to_string());
    ui::info("Press Ctrl+C to stop");

    switchboard_gateway::start(&config, shutdown_signal()).await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
