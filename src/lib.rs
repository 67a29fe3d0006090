#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! honeyctl library — the control plane of a distributed honeypot.
//!
//! - `command` — per-node command channels, connection registry, stream
//!   acceptor and task-correlated dispatcher (server side)
//! - `node` — the node agent: command client with reconnect, handlers,
//!   registration and telemetry
//! - `tunnel` — TCP-over-stream relay and decoy port listeners
//! - `proto` — wire messages shared by server and node
//! - `store` — in-memory node, scan and host records
//! - `routes`, `state` — the HTTP/WS surface of the server
//! - `config`, `error` — configuration loading and error taxonomy

pub mod command;
pub mod config;
pub mod error;
pub mod node;
pub mod proto;
pub mod routes;
pub mod state;
pub mod store;
pub mod tunnel;

pub use config::Config;
pub use state::ServerState;
