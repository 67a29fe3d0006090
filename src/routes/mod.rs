//! HTTP and WebSocket routes of the control-plane server.
//!
//! - `health`: liveness probe.
//! - `nodes`: node registration, resource reports and node listing.
//! - `network`: operator commands (interface flush, network scan) and their results.
//! - `stream`: the per-node command and tunnel WebSocket streams.

pub mod health;
pub mod network;
pub mod nodes;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::proto::{COMMAND_PATH, REGISTER_PATH, RESOURCE_PATH, TUNNEL_PATH};
use crate::state::ServerState;

pub fn router(state: ServerState) -> Router {
    let node_routes = Router::new()
        .route(REGISTER_PATH, post(nodes::register))
        .route(RESOURCE_PATH, post(nodes::report_resource))
        .route(COMMAND_PATH, get(stream::command_stream))
        .route(TUNNEL_PATH, get(stream::tunnel_stream));

    let operator_routes = Router::new()
        .route("/api/nodes", get(nodes::list_nodes))
        .route("/api/nodes/{node_id}", get(nodes::get_node))
        .route("/api/nodes/{node_id}/network/flush", post(network::flush))
        .route("/api/nodes/{node_id}/scan", post(network::scan))
        .route("/api/scans/{task_id}", get(network::scan_status))
        .route("/api/nets/{net_id}/hosts", get(network::net_hosts));

    Router::new()
        .route("/api/health", get(health::health))
        .merge(node_routes)
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
