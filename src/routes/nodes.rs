//! Node registration, resource reports and node listing.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::proto::{BaseResponse, NodeResourceRequest, RegisterRequest};
use crate::state::ServerState;
use crate::store::NodeRecord;

/// `POST /api/node/register` — insert or refresh a node record.
pub async fn register(
    State(state): State<ServerState>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<BaseResponse>) {
    if req.node_uid.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(BaseResponse::refused("node_uid is required")),
        );
    }
    let node_uid = req.node_uid.clone();
    let ip = req.ip.clone();
    let version = req.version.clone();
    if state.nodes.register(req) {
        info!(node_id = %node_uid, ip, version, "Node registered");
    } else {
        debug!(node_id = %node_uid, ip, "Node re-registered");
    }
    (StatusCode::OK, Json(BaseResponse::ok()))
}

/// `POST /api/node/resource` — store a resource sample for a registered node.
pub async fn report_resource(
    State(state): State<ServerState>,
    Json(req): Json<NodeResourceRequest>,
) -> (StatusCode, Json<BaseResponse>) {
    if state.nodes.report_resource(&req.node_uid, req.resource_info) {
        (StatusCode::OK, Json(BaseResponse::ok()))
    } else {
        warn!(node_id = %req.node_uid, "Resource report from unregistered node");
        (
            StatusCode::NOT_FOUND,
            Json(BaseResponse::refused(format!("node {} is not registered", req.node_uid))),
        )
    }
}

fn with_online(state: &ServerState, record: NodeRecord) -> Value {
    let online = state.registry.is_online(&record.node_uid);
    let mut value = json!(record);
    value["online"] = json!(online);
    value
}

/// `GET /api/nodes` — every registered node with its live `online` flag.
pub async fn list_nodes(State(state): State<ServerState>) -> Json<Value> {
    let nodes: Vec<Value> = state
        .nodes
        .list()
        .into_iter()
        .map(|record| with_online(&state, record))
        .collect();
    Json(json!({ "nodes": nodes }))
}

/// `GET /api/nodes/{node_id}`
pub async fn get_node(
    State(state): State<ServerState>,
    Path(node_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.nodes.get(&node_id) {
        Some(record) => Ok(Json(with_online(&state, record))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("node {node_id} is not registered"), "code": "NODE_NOT_FOUND" })),
        )),
    }
}
