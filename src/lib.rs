//! backhaul: bidirectional RPC transport between an agent and a collector
//! over a single long-lived connection.
//!
//! Three interaction modes share the wire:
//! - fire-and-forget sends ([`Session::send`], [`Session::send_sync`],
//!   [`Session::send_async`])
//! - correlated request/response with timeout ([`Session::request`])
//! - multiplexed stream channels ([`Session::open_stream`])
//!
//! This crate defines:
//! - Wire packets ([`Packet`], [`packet_type`])
//! - The session handler and dispatcher ([`Session`], [`SessionConfig`])
//! - The pending-call registry ([`PendingCalls`])
//! - Stream multiplexing ([`StreamMultiplexer`], [`StreamHandle`])
//! - The connection lifecycle ([`SessionState`])
//! - Collaborator traits ([`MessageListener`], [`Reconnector`])
//! - Transports ([`Transport`])

mod error;
mod listener;
mod packet;
mod pending;
mod reconnect;
mod session;
mod state;
mod stream;
mod transport;

pub use error::*;
pub use listener::*;
pub use packet::*;
pub use pending::*;
pub use reconnect::*;
pub use session::*;
pub use state::*;
pub use stream::*;
pub use transport::*;
