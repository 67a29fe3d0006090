//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::ServerState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version and the number of nodes holding a live
/// command stream.
pub async fn health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "nodes_online": state.registry.online_count(),
        "nodes_registered": state.nodes.list().len(),
    }))
}
