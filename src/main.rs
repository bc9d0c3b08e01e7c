//! Service gateway.
//!
//! Routing and resiliency layer between clients and logical backend services.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌───────────────────────────────────────────────────────┐
//!                    │                    SERVICE GATEWAY                     │
//!   Client request   │  ┌────────┐   ┌─────────────┐   ┌──────────────────┐  │
//!   ─────────────────┼─▶│  http  │──▶│ route table │──▶│  service router  │  │
//!                    │  │ server │   │ (path→svc)  │   │ retry / failover │  │
//!                    │  └───┬────┘   └─────────────┘   └────────┬─────────┘  │
//!                    │      │ upgrade                           │            │
//!                    │      ▼                                   ▼            │
//!                    │  ┌──────────────┐   ┌───────────┐  ┌───────────────┐  │
//!                    │  │  websocket   │   │ discovery │◀─│ load balancer │  │
//!                    │  │ manager+proxy│   │   cache   │  │ + breakers    │  │
//!                    │  └──────────────┘   └─────▲─────┘  └───────┬───────┘  │
//!                    │                           │ registry       │          │
//!   Client response  │                                             ▼          │
//!   ◀────────────────┼──────────────────────────────────────── backend ◀─────┼── instances
//!                    └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use service_gateway::config::loader::load_config;
use service_gateway::config::watcher::ConfigWatcher;
use service_gateway::config::GatewayConfig;
use service_gateway::lifecycle::{wait_for_signal, Shutdown};
use service_gateway::observability::{logging, metrics};
use service_gateway::HttpServer;

#[derive(Parser)]
#[command(name = "service-gateway")]
#[command(about = "Routing and resiliency gateway for backend services", long_about = None)]
struct Args {
    /// Path to the TOML config file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "service-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        services = config.services.len(),
        registry = ?config.registry.kind,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher must outlive the server.
    let (config_updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (updates, Some(handle)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (updates, None)
                }
            }
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.trigger();
    });

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    shutdown.drain(Duration::from_secs(10)).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
