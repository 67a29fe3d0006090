//! The node agent.
//!
//! - `client`: command stream state machine with reconnect.
//! - `handlers`: network flush and network scan.
//! - `probe`, `iprange`, `sysinfo`: what the handlers and reports observe.
//! - `transport`: WebSocket connector for command and tunnel streams.
//! - `report`: registration and resource telemetry over HTTP.
//! - `identity`: persistent node id.

pub mod client;
pub mod handlers;
pub mod identity;
pub mod iprange;
pub mod probe;
pub mod report;
pub mod sysinfo;
pub mod transport;

pub use client::{ClientSettings, CommandHandler, ConnState, Connector, HandlerSet, NodeClient, Responder};
pub use transport::WsConnector;
