//! TCP tunnels carried over framed streams.
//!
//! - `frame`: binary frame codec (`address` + `chunk`).
//! - `relay`: initiator and acceptor roles and the bidirectional byte relay.
//! - `ports`: node-side decoy listeners that open a tunnel per connection.
//!
//! The node is the initiator (it owns the decoy listeners); the server is the
//! acceptor and dials the bait service named in the first frame.

pub mod frame;
pub mod ports;
pub mod relay;

pub use frame::TunnelFrame;
pub use ports::{TunnelOpener, TunnelStore};
pub use relay::RelayStats;
