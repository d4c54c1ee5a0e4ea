//! Network layer for wsrelay
//!
//! Accepts TCP connections, serves them as HTTP/1.1, upgrades every request
//! to a WebSocket and hands the transport to the relay.

mod connection_pool;
mod handler;
mod upgrade;

pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use handler::{BoundHandler, NetworkHandler};
pub use upgrade::{Rejection, Upgrader};

/// Maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// WebSocket protocol version accepted by the handshake
pub const WEBSOCKET_VERSION: &str = "13";
