//! imagegen MCP server
//!
//! Multi-provider image generation over MCP with local artifact storage and
//! request caching.

use anyhow::{Context, Result};
use clap::Parser;
use imagegen_mcp::{ImageHandler, ImageServer, http, maintenance};
use imagegen_mcp_common::server::wait_for_shutdown_signal;
use imagegen_mcp_common::{Config, McpServerBuilder, TransportArgs, shutdown_channel};
use std::sync::Arc;
use tokio::sync::watch;

/// Command-line arguments for the image server.
#[derive(Parser, Debug)]
#[command(name = "imagegen-mcp")]
#[command(about = "MCP server for multi-provider image generation")]
struct Args {
    /// Transport configuration
    #[command(flatten)]
    transport: TransportArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    // A subscriber may already be installed when embedded.
    let _ = imagegen_mcp_common::tracing::try_init_tracing(&config.server.log_level);

    tracing::info!(
        name = %config.server.name,
        version = %config.server.version,
        storage = %config.storage.base_path.display(),
        "imagegen-mcp server starting..."
    );

    let transport = args.transport.into_transport(&config.server);
    let storage_config = config.storage.clone();
    let handler = ImageHandler::from_config(config)
        .await
        .context("Failed to initialize image handler")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let maintenance = maintenance::spawn(
        handler.store().clone(),
        handler.cache().clone(),
        storage_config,
        stop_rx,
    );

    #[cfg(unix)]
    spawn_reload_on_hangup(handler.registry().clone());

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = stop_tx.send(true);
        let _ = shutdown_tx.send(());
    });

    let routes = http::image_routes(Arc::clone(handler.store()));
    let server = ImageServer::new(handler);

    McpServerBuilder::new(server)
        .with_transport(transport)
        .with_routes(routes)
        .with_shutdown(shutdown_rx)
        .run()
        .await?;

    maintenance.abort();
    tracing::info!("Server stopped");
    Ok(())
}

/// Re-read configuration on SIGHUP and apply provider enable flags.
#[cfg(unix)]
fn spawn_reload_on_hangup(registry: Arc<imagegen_mcp::ProviderRegistry>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register SIGHUP handler, live reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match Config::reload_from_env() {
                Ok(config) => {
                    registry.apply_config(&config);
                    tracing::info!("Configuration reloaded");
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    "Configuration reload failed, keeping current settings"
                ),
            }
        }
    });
}
