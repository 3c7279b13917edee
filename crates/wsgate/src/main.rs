//! # wsgate
//!
//! Demo binary: `serve` runs an echo server on top of `wsgate-server`,
//! `client` dials it and sends a message on a fixed interval.

#![deny(unsafe_code)]

mod client;
mod echo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use wsgate_core::logging::{LogFormat, init_subscriber};
use wsgate_server::{Registry, ServerConfig, WsServer};
use wsgate_settings::GateSettings;

use crate::client::ClientOptions;
use crate::echo::EchoHandler;

/// wsgate `WebSocket` server.
#[derive(Parser, Debug)]
#[command(name = "wsgate", about = "Reactor-style WebSocket connection server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server.
    Serve {
        /// Settings file (defaults to `~/.wsgate/settings.json`).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Dial a server and send a message periodically.
    Client {
        /// Server URL.
        #[arg(long, default_value = "ws://127.0.0.1:8081/echo")]
        url: String,

        /// Message to send.
        #[arg(long, default_value = "hello, world!")]
        message: String,

        /// Seconds between messages.
        #[arg(long, default_value = "10")]
        interval_secs: u64,

        /// Stop after this many round trips.
        #[arg(long)]
        count: Option<u64>,
    },
}

/// Map loaded settings onto the server configuration.
fn server_config(settings: &GateSettings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        idle_timeout_secs: settings.idle.timeout_secs,
        tick_interval_ms: settings.wheel.tick_ms,
        wheel_slots: settings.wheel.slots,
        timer_queue_capacity: settings.wheel.queue_capacity,
        timer_max_jobs: settings.wheel.max_jobs,
        pool_size: settings.pool.size,
        pool_expiry_secs: settings.pool.expiry_secs,
        pool_nonblocking: settings.pool.nonblocking,
        outbound_queue: settings.server.outbound_queue,
        max_frame_bytes: settings.server.max_frame_bytes,
        max_handshake_bytes: settings.server.max_handshake_bytes,
        readout_interval_secs: settings.server.readout_secs,
    }
}

async fn serve(config: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let settings_path = config.unwrap_or_else(wsgate_settings::settings_path);
    let settings = wsgate_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    let format = LogFormat::parse(&settings.logging.format).unwrap_or_default();
    init_subscriber(&settings.logging.level, format);

    let mut config = server_config(&settings);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    let health_addr = settings
        .server
        .health_port
        .map(|health_port| format!("{}:{health_port}", config.host));

    let registry = Registry::new(settings.registry.queue_capacity)
        .context("Invalid registry configuration")?;
    let handler = Arc::new(EchoHandler::new(registry.handle()));
    let mut server =
        WsServer::new(config, handler, registry).context("Invalid server configuration")?;
    if health_addr.is_some() {
        match wsgate_server::metrics::install_recorder() {
            Ok(handle) => server = server.with_metrics(handle),
            Err(err) => tracing::warn!(error = %err, "metrics recorder not installed"),
        }
    }

    let (addr, accept) = server.listen().await.context("Failed to bind server")?;
    if let Some(health_addr) = health_addr {
        let _ = server
            .serve_health(&health_addr)
            .await
            .context("Failed to bind health endpoint")?;
    }
    tracing::info!("wsgate listening on ws://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown_gracefully(None).await;
    let _ = accept.await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Serve { config, host, port } => serve(config, host, port).await,
        Command::Client {
            url,
            message,
            interval_secs,
            count,
        } => {
            init_subscriber("info", LogFormat::Compact);
            client::check_url(&url)?;
            client::run(ClientOptions {
                url,
                message,
                interval: Duration::from_secs(interval_secs.max(1)),
                count,
            })
            .await
        }
    }
}
