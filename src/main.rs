#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # honeyctl
//!
//! Control plane for a distributed honeypot.
//!
//! ## Subcommands
//!
//! - `honeyctl serve` — run the control-plane server
//! - `honeyctl node` — run the node agent
//!
//! ## API surface (server)
//!
//! | Method | Path                                 | Description                         |
//! |--------|--------------------------------------|-------------------------------------|
//! | GET    | `/api/health`                        | Liveness probe                      |
//! | POST   | `/api/node/register`                 | Node registration                   |
//! | POST   | `/api/node/resource`                 | Node resource report                |
//! | GET    | `/api/node/command`                  | Node command stream (WS)            |
//! | GET    | `/api/node/tunnel`                   | Node tunnel stream (WS)             |
//! | GET    | `/api/nodes`                         | Registered nodes                    |
//! | GET    | `/api/nodes/{node_id}`               | One node                            |
//! | POST   | `/api/nodes/{node_id}/network/flush` | Refresh a node's interface list     |
//! | POST   | `/api/nodes/{node_id}/scan`          | Start a network scan                |
//! | GET    | `/api/scans/{task_id}`               | Scan status and hosts found         |
//! | GET    | `/api/nets/{net_id}/hosts`           | Host table of a network             |
//!
//! Stream upgrades carry the node id in the `x-node-id` header.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use honeyctl::config::Config;
use honeyctl::node::handlers::{FlushHandler, ScanHandler, SystemInterfaces};
use honeyctl::node::identity::resolve_node_id;
use honeyctl::node::probe::ArpCacheProber;
use honeyctl::node::report::{run_telemetry, NodeFacts, ServerApi};
use honeyctl::node::{ClientSettings, HandlerSet, NodeClient, WsConnector};
use honeyctl::proto::CmdType;
use honeyctl::state::ServerState;
use honeyctl::tunnel::TunnelStore;
use honeyctl::routes;

/// Control plane for a distributed honeypot.
#[derive(Parser)]
#[command(name = "honeyctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane server.
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the node agent.
    Node {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Serve { config } | Commands::Node { config } => config.clone(),
    };
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("honeyctl: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match cli.command {
        Commands::Serve { .. } => run_server(config).await,
        Commands::Node { .. } => run_node(config).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

async fn run_server(config: Config) {
    info!("honeyctl v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let state = ServerState::new(config);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Shutting down...");
    let closed = state.registry.close_all();
    state.shutdown.cancel();
    info!(channels = closed, "Command channels closed, tunnels cancelled");
}

async fn run_node(config: Config) {
    let node = config.node;
    let node_id = match resolve_node_id(&node.uid, &node.id_file) {
        Ok(id) => id,
        Err(e) => {
            error!("Cannot establish node identity: {e}");
            std::process::exit(1);
        }
    };
    info!("honeyctl node v{} starting", env!("CARGO_PKG_VERSION"));
    info!(node_id = %node_id, server = %node.server_url, "Node identity resolved");

    let root = CancellationToken::new();
    let connector = WsConnector::new(&node.server_url, &node_id);

    let handlers = HandlerSet::new()
        .with(
            CmdType::NetworkFlush,
            FlushHandler::new(SystemInterfaces, node.filter_prefixes.clone()),
        )
        .with(
            CmdType::NetworkScan,
            ScanHandler::new(ArpCacheProber::new(node.probe_timeout()), node.scan_concurrency),
        );
    let client = NodeClient::new(
        &node_id,
        connector.clone(),
        handlers,
        ClientSettings {
            reconnect_delay: node.reconnect_delay(),
            queue_capacity: node.response_queue_capacity,
            heartbeat_interval: node.heartbeat_interval(),
        },
    );
    client.start();

    let telemetry = match ServerApi::new(&node.server_url) {
        Ok(api) => {
            let facts = NodeFacts {
                node_id: node_id.clone(),
                network: node.network.clone(),
                filter_prefixes: node.filter_prefixes.clone(),
                node_path: std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "/".to_string()),
            };
            Some(tokio::spawn(run_telemetry(
                api,
                facts,
                node.resource_interval(),
                root.child_token(),
            )))
        }
        Err(e) => {
            warn!("Telemetry disabled: {e}");
            None
        }
    };

    let ports = TunnelStore::new();
    let opener = Arc::new(connector);
    for forward in &node.ports {
        if let Err(e) = ports.open(&forward.local, &forward.target, Arc::clone(&opener), &root).await {
            warn!(local = %forward.local, target = %forward.target, "Decoy port not opened: {e}");
        }
    }

    shutdown_signal().await;

    info!("Shutting down...");
    client.shutdown();
    root.cancel();
    let listeners = ports.close_all();
    if let Some(task) = telemetry {
        let _ = task.await;
    }
    info!(listeners, "Node stopped");
}
