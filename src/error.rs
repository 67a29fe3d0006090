//! Error taxonomy shared by the server, the node agent and the tunnel relay.
//!
//! Transport-level failures ([`TransportError`]) are kept apart from
//! operation-level failures ([`CommandError::Rejected`]) so callers can tell a
//! dead stream from a node that answered "no".

use std::io;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Failure of a single command round-trip as seen by the dispatcher.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("node {0} is offline")]
    NodeOffline(String),

    #[error("node {0} is busy: request queue full")]
    Busy(String),

    #[error("no terminal response from node {node_id} for task {task_id}")]
    Timeout { node_id: String, task_id: String },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("node rejected task {task_id}: {message}")]
    Rejected { task_id: String, message: String },

    #[error("unexpected response type for task {0}")]
    UnexpectedResponse(String),
}

impl CommandError {
    /// Map to an HTTP status and machine-readable code.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NodeOffline(_) => (StatusCode::NOT_FOUND, "NODE_OFFLINE"),
            Self::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "NODE_BUSY"),
            Self::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            Self::Rejected { .. } => (StatusCode::BAD_GATEWAY, "NODE_REJECTED"),
            Self::Transport(_) | Self::UnexpectedResponse(_) => {
                (StatusCode::BAD_GATEWAY, "TRANSPORT_FAILURE")
            }
        }
    }

    /// Render as the `{"error", "code"}` body used across the HTTP API.
    pub fn into_response(self) -> (StatusCode, Json<Value>) {
        let (status, code) = self.status();
        (
            status,
            Json(json!({ "error": self.to_string(), "code": code })),
        )
    }
}

/// A stream read/write failed or a message could not be coded.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("websocket: {0}")]
    Axum(#[from] axum::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("stream closed")]
    Closed,
}

/// Malformed binary tunnel frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("address length {declared} exceeds frame body {available}")]
    AddressOverflow { declared: usize, available: usize },

    #[error("address is not valid UTF-8")]
    AddressEncoding,

    #[error("address too long: {0} bytes")]
    AddressTooLong(usize),
}

/// Failure of a tunnel before or during relaying.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("first tunnel frame carried no target address")]
    MissingAddress,

    #[error("dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("tunnel cancelled")]
    Cancelled,

    #[error("tunnel transport: {0}")]
    Transport(#[from] TransportError),

    #[error("tunnel io: {0}")]
    Io(#[from] io::Error),
}

/// Configuration could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Unary call from node to server failed.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server refused: {0}")]
    Refused(String),
}
