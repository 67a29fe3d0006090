//! Operator commands sent to nodes over their command streams.
//!
//! | Route                                  | Operation                     |
//! |----------------------------------------|-------------------------------|
//! | `POST /api/nodes/{id}/network/flush`   | refresh a node's interfaces   |
//! | `POST /api/nodes/{id}/scan`            | start a scan (returns at once)|
//! | `GET /api/scans/{task_id}`             | scan status and hosts so far  |
//! | `GET /api/nets/{net_id}/hosts`         | host table of a network       |

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn, Instrument};

use crate::command::{ScanOutcome, ScanReport};
use crate::proto::{NetworkFlushIn, NetworkScanIn};
use crate::state::ServerState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": error.to_string(), "code": code })))
}

/// `POST /api/nodes/{node_id}/network/flush`
///
/// The body is optional. Without `filter_prefixes` the node applies its own
/// default filter.
pub async fn flush(State(state): State<ServerState>, Path(node_id): Path<String>, body: Bytes) -> ApiResult {
    let input: NetworkFlushIn = if body.iter().all(u8::is_ascii_whitespace) {
        NetworkFlushIn::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e))?
    };

    let report = state
        .dispatcher
        .network_flush(&node_id, input.filter_prefixes)
        .await
        .map_err(|e| {
            warn!(node_id, error = %e, "Network flush failed");
            e.into_response()
        })?;

    state.nodes.set_interfaces(&node_id, report.interfaces.clone());
    Ok(Json(json!(report)))
}

/// `POST /api/nodes/{node_id}/scan`
///
/// Queues the scan and returns its task id. Progress is tracked in the scan
/// store, and the network's host table is reconciled once the node reports
/// the end of the scan.
pub async fn scan(
    State(state): State<ServerState>,
    Path(node_id): Path<String>,
    Json(input): Json<NetworkScanIn>,
) -> ApiResult {
    let net_id = input.net_id;
    if let Err(running) = state.scans.reserve(&node_id, net_id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            "SCAN_IN_PROGRESS",
            format!("network {net_id} on node {node_id} is already being scanned (task {running})"),
        ));
    }

    let progress_store = state.scans.clone();
    let progress_node = node_id.clone();
    let complete_store = state.scans.clone();
    let dispatched = state
        .dispatcher
        .network_scan(
            &node_id,
            input,
            move |task_id, out| progress_store.progress(task_id, &progress_node, out),
            move |report| {
                if report.outcome == ScanOutcome::Completed {
                    let diff = complete_store.reconcile(report.net_id, &report.hosts);
                    info!(
                        net_id = report.net_id,
                        added = diff.added,
                        updated = diff.updated,
                        removed = diff.removed,
                        "Host table reconciled"
                    );
                }
            },
        )
        .await;

    let task = match dispatched {
        Ok(task) => task,
        Err(e) => {
            state.scans.release(&node_id, net_id);
            warn!(node_id, net_id, error = %e, "Scan dispatch failed");
            return Err(e.into_response());
        }
    };

    let task_id = task.task_id.clone();
    state.scans.start(&task_id, &node_id, net_id);

    let scans = state.scans.clone();
    let span = tracing::info_span!("scan_watch", node_id = %node_id, task_id = %task_id);
    let watched_task = task_id.clone();
    tokio::spawn(
        async move {
            let report = match task.handle.await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Scan worker aborted");
                    ScanReport {
                        task_id: watched_task,
                        node_id,
                        net_id,
                        outcome: ScanOutcome::Failed(format!("scan worker aborted: {e}")),
                        hosts: Vec::new(),
                    }
                }
            };
            scans.finish(&report);
        }
        .instrument(span),
    );

    Ok(Json(json!({
        "task_id": task_id,
        "message": "scan started",
    })))
}

/// `GET /api/scans/{task_id}`
pub async fn scan_status(State(state): State<ServerState>, Path(task_id): Path<String>) -> ApiResult {
    state
        .scans
        .get(&task_id)
        .map(|record| Json(json!(record)))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", format!("no scan task {task_id}")))
}

/// `GET /api/nets/{net_id}/hosts`
pub async fn net_hosts(State(state): State<ServerState>, Path(net_id): Path<u32>) -> Json<Value> {
    let hosts = state.scans.hosts(net_id);
    Json(json!({ "net_id": net_id, "count": hosts.len(), "hosts": hosts }))
}
