//! Server side of the node command channel.
//!
//! - `queue`: bounded response queue with selective receive by task id.
//! - `channel`: per-connection request/response queues and lifecycle.
//! - `registry`: node id → live channel, one per node.
//! - `acceptor`: runs the send/receive loops of one node stream.
//! - `dispatcher`: task ids, request submission and response correlation.

pub mod acceptor;
pub mod channel;
pub mod dispatcher;
pub mod queue;
pub mod registry;

pub use channel::{ChannelSettings, CommandChannel};
pub use dispatcher::{DispatchSettings, Dispatcher, FlushReport, ScanOutcome, ScanReport, ScanTask};
pub use registry::ConnectionRegistry;
