//! Registration and periodic resource reports.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sysinfo;
use crate::error::ApiError;
use crate::proto::{BaseResponse, NodeResourceRequest, RegisterRequest, REGISTER_PATH, RESOURCE_PATH};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Unary calls to the server.
#[derive(Clone)]
pub struct ServerApi {
    client: reqwest::Client,
    base: String,
}

impl ServerApi {
    pub fn new(server_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let resp = self.client.post(format!("{}{path}", self.base)).json(body).send().await?;
        let status = resp.status();
        let reply = resp
            .json::<BaseResponse>()
            .await
            .unwrap_or_else(|_| BaseResponse::refused(format!("HTTP {status}")));
        if reply.ok && status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Refused(reply.message))
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ApiError> {
        self.post(REGISTER_PATH, request).await
    }

    pub async fn report_resource(&self, request: &NodeResourceRequest) -> Result<(), ApiError> {
        self.post(RESOURCE_PATH, request).await
    }
}

/// What the node reports about itself.
#[derive(Debug, Clone)]
pub struct NodeFacts {
    pub node_id: String,
    /// Primary interface name.
    pub network: String,
    pub filter_prefixes: Vec<String>,
    /// Directory whose filesystem usage is reported.
    pub node_path: String,
}

pub async fn build_register_request(facts: &NodeFacts) -> RegisterRequest {
    let links = match sysinfo::collect_links().await {
        Ok(links) => links,
        Err(e) => {
            warn!(error = %e, "Cannot enumerate interfaces for registration");
            Vec::new()
        }
    };
    let (ip, mac) = sysinfo::primary_address(&links, &facts.network);
    RegisterRequest {
        node_uid: facts.node_id.clone(),
        ip,
        mac,
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("HONEYCTL_COMMIT").unwrap_or("unknown").to_string(),
        system_info: sysinfo::system_info(),
        network_interfaces: sysinfo::network_infos(&links, &facts.filter_prefixes),
    }
}

/// Register until accepted, then report resources every `interval`.
/// A refused report means the server forgot this node, so it re-registers.
pub async fn run_telemetry(api: ServerApi, facts: NodeFacts, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut registered = false;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !registered {
            let request = build_register_request(&facts).await;
            match api.register(&request).await {
                Ok(()) => {
                    info!(node_id = %facts.node_id, ip = %request.ip, "Registered with server");
                    registered = true;
                }
                Err(e) => {
                    warn!(error = %e, "Registration failed, will retry");
                    continue;
                }
            }
        }

        let report = NodeResourceRequest {
            node_uid: facts.node_id.clone(),
            resource_info: sysinfo::resource_info(&facts.node_path).await,
        };
        match api.report_resource(&report).await {
            Ok(()) => debug!(cpu = report.resource_info.cpu_use_rate, "Resource report sent"),
            Err(ApiError::Refused(message)) => {
                warn!(message, "Resource report refused, re-registering");
                registered = false;
            }
            Err(e) => warn!(error = %e, "Resource report failed"),
        }
    }
    debug!("Telemetry stopped");
}
