//! Wire messages exchanged between the server and its nodes.
//!
//! Command stream messages are JSON text frames. The payload is tagged with
//! its command type so the type travels with the data it describes:
//!
//! ```json
//! {"task_id":"network_flush-1718000000000000000","node_id":"7d1c…",
//!  "payload":{"cmd_type":"network_flush","filter_prefixes":["hy-"]}}
//! ```

use std::fmt;
use std::pin::Pin;

use futures::{Sink, Stream};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Upgrade header carrying the node identity.
pub const NODE_ID_HEADER: &str = "x-node-id";

/// Command stream endpoint.
pub const COMMAND_PATH: &str = "/api/node/command";
/// Tunnel stream endpoint.
pub const TUNNEL_PATH: &str = "/api/node/tunnel";
pub const REGISTER_PATH: &str = "/api/node/register";
pub const RESOURCE_PATH: &str = "/api/node/resource";

/// Write half of a framed transport.
pub type BoxSink<T> = Pin<Box<dyn Sink<T, Error = TransportError> + Send>>;
/// Read half of a framed transport. Ends when the peer closes.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, TransportError>> + Send>>;

// ─── Command stream ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdType {
    NetworkFlush,
    NetworkScan,
}

impl CmdType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFlush => "network_flush",
            Self::NetworkScan => "network_scan",
        }
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdRequest {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub node_id: String,
    pub payload: RequestPayload,
}

impl CmdRequest {
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            task_id: String::new(),
            node_id: String::new(),
            payload,
        }
    }

    /// `None` for command types this build does not know.
    pub fn cmd_type(&self) -> Option<CmdType> {
        match self.payload {
            RequestPayload::NetworkFlush(_) => Some(CmdType::NetworkFlush),
            RequestPayload::NetworkScan(_) => Some(CmdType::NetworkScan),
            RequestPayload::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd_type", rename_all = "snake_case")]
pub enum RequestPayload {
    NetworkFlush(NetworkFlushIn),
    NetworkScan(NetworkScanIn),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkFlushIn {
    #[serde(default)]
    pub filter_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkScanIn {
    /// Interface to probe from.
    #[serde(default)]
    pub network: String,
    pub ip_range: String,
    #[serde(default)]
    pub filter_ips: Vec<String>,
    #[serde(default)]
    pub net_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdResponse {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub node_id: String,
    pub payload: ResponsePayload,
}

impl CmdResponse {
    pub fn new(request: &CmdRequest, payload: ResponsePayload) -> Self {
        Self {
            task_id: request.task_id.clone(),
            node_id: request.node_id.clone(),
            payload,
        }
    }

    /// Keepalive sent by an idle node so the server can tell a quiet stream
    /// from a dead one. Carries no task id.
    pub fn heartbeat(node_id: &str) -> Self {
        Self {
            task_id: String::new(),
            node_id: node_id.to_string(),
            payload: ResponsePayload::Heartbeat,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, ResponsePayload::Heartbeat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd_type", rename_all = "snake_case")]
pub enum ResponsePayload {
    NetworkFlush(NetworkFlushOut),
    NetworkScan(NetworkScanOut),
    Heartbeat,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkFlushOut {
    #[serde(default)]
    pub interfaces: Vec<NetworkInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkScanOut {
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub net_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}

/// One IPv4 address of a local interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Interface name.
    pub network: String,
    pub ip: String,
    /// Network in CIDR notation, e.g. `192.168.1.0/24`.
    pub net: String,
    /// Dotted netmask.
    pub mask: String,
}

// ─── Unary calls ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_uid: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub distribution: String,
    pub kernel: String,
    pub arch: String,
    /// Unix seconds.
    pub boot_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResourceRequest {
    pub node_uid: String,
    pub resource_info: ResourceInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub cpu_count: u32,
    pub cpu_use_rate: f64,
    pub mem_total: u64,
    pub mem_use_rate: f64,
    pub disk_total: u64,
    pub disk_use_rate: f64,
    pub node_path: String,
    /// Resident memory of the agent itself, in bytes.
    pub node_resource_occupancy: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseResponse {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
}

impl BaseResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}
