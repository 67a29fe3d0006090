//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HONEYCTL_LISTEN`, `HONEYCTL_SERVER_URL`,
//!    `HONEYCTL_NODE_UID`
//! 2. **Config file**: path via `--config <path>`, or `honeyctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! One file serves both roles; `serve` reads `[server]`, `node` reads `[node]`.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9527"
//! request_queue_capacity = 10
//! response_queue_capacity = 10
//! enqueue_timeout_ms = 1000
//! response_push_timeout_ms = 5000
//! flush_timeout_secs = 30
//! scan_timeout_secs = 300
//!
//! [node]
//! server_url = "http://10.0.0.1:9527"
//! uid = ""                      # empty = read or create id_file
//! id_file = "/var/lib/honeyctl/node_id"
//! network = "eth0"
//! filter_prefixes = ["hy-"]
//! reconnect_delay_ms = 2000
//! resource_interval_secs = 5
//! scan_concurrency = 200
//! probe_timeout_ms = 1000
//!
//! [[node.ports]]
//! local = "10.0.0.50:22"
//! target = "10.0.0.1:2222"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::command::{ChannelSettings, DispatchSettings};
use crate::error::ConfigError;

const DEFAULT_CONFIG_FILE: &str = "honeyctl.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control-plane server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:9527`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending requests per node before dispatch reports busy (default 10).
    #[serde(default = "default_queue_capacity")]
    pub request_queue_capacity: usize,
    /// Unclaimed responses buffered per node (default 10).
    #[serde(default = "default_queue_capacity")]
    pub response_queue_capacity: usize,
    /// Wait for request-queue space in milliseconds (default 1000).
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    /// Wait for response-queue space before dropping, in ms (default 5000).
    #[serde(default = "default_response_push_timeout_ms")]
    pub response_push_timeout_ms: u64,
    /// Deadline for a network flush (default 30).
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Deadline for a whole network scan (default 300).
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Close a command stream silent for this long (default 30).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Finished scan records kept for status queries (default 256).
    #[serde(default = "default_scan_retention")]
    pub scan_retention: usize,
}

/// Node agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Server base URL. Streams use the matching `ws://`/`wss://` scheme.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Explicit node identity. Override with `HONEYCTL_NODE_UID`.
    #[serde(default)]
    pub uid: String,
    /// Where a generated identity is persisted (default `node_id`).
    #[serde(default = "default_id_file")]
    pub id_file: String,
    /// Primary interface reported at registration (default `eth0`).
    #[serde(default = "default_network")]
    pub network: String,
    /// Interfaces whose names start with one of these are never reported.
    #[serde(default = "default_filter_prefixes")]
    pub filter_prefixes: Vec<String>,
    /// Fixed delay before reconnecting the command stream (default 2000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Outbound response queue size (default 10).
    #[serde(default = "default_queue_capacity")]
    pub response_queue_capacity: usize,
    /// Seconds between resource reports (default 5).
    #[serde(default = "default_resource_interval_secs")]
    pub resource_interval_secs: u64,
    /// Seconds between keepalives on an idle command stream (default 10).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Hosts probed in parallel during a scan (default 200).
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Per-host probe timeout in milliseconds (default 1000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Decoy ports forwarded through tunnels.
    #[serde(default)]
    pub ports: Vec<PortForward>,
}

/// One decoy listener: connections to `local` are tunnelled to `target`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub local: String,
    pub target: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:9527".to_string()
}
fn default_queue_capacity() -> usize {
    10
}
fn default_enqueue_timeout_ms() -> u64 {
    1000
}
fn default_response_push_timeout_ms() -> u64 {
    5000
}
fn default_flush_timeout_secs() -> u64 {
    30
}
fn default_scan_timeout_secs() -> u64 {
    300
}
fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_scan_retention() -> usize {
    crate::store::DEFAULT_SCAN_RETENTION
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_server_url() -> String {
    "http://127.0.0.1:9527".to_string()
}
fn default_id_file() -> String {
    "node_id".to_string()
}
fn default_network() -> String {
    "eth0".to_string()
}
fn default_filter_prefixes() -> Vec<String> {
    vec!["hy-".to_string()]
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_resource_interval_secs() -> u64 {
    5
}
fn default_scan_concurrency() -> usize {
    200
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_queue_capacity: default_queue_capacity(),
            response_queue_capacity: default_queue_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            response_push_timeout_ms: default_response_push_timeout_ms(),
            flush_timeout_secs: default_flush_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            scan_retention: default_scan_retention(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            uid: String::new(),
            id_file: default_id_file(),
            network: default_network(),
            filter_prefixes: default_filter_prefixes(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            response_queue_capacity: default_queue_capacity(),
            resource_interval_secs: default_resource_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            scan_concurrency: default_scan_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
            ports: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            request_capacity: self.request_queue_capacity,
            response_capacity: self.response_queue_capacity,
            response_push_timeout: Duration::from_millis(self.response_push_timeout_ms),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs.max(1)),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            flush_timeout: Duration::from_secs(self.flush_timeout_secs),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
        }
    }
}

impl NodeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_secs(self.resource_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `honeyctl.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("HONEYCTL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("HONEYCTL_SERVER_URL") {
            config.node.server_url = url;
        }
        if let Ok(uid) = std::env::var("HONEYCTL_NODE_UID") {
            config.node.uid = uid;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
