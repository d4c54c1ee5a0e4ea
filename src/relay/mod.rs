//! Per-connection echo relay
//!
//! Each accepted WebSocket is split into an inbound half and an outbound
//! half. The inbound loop reads payloads and hands them to the outbound loop
//! over a rendezvous relay channel, waiting for each one to be written before
//! reading the next frame; the outbound loop is the only writer and
//! interleaves relayed payloads with heartbeat probes. A [`CloseLatch`]
//! shared by both loops makes closing the transport idempotent.
//!
//! ```text
//! peer ──frames──> InboundLoop ──relay channel──> OutboundLoop ──frames──> peer
//!                       │                               │
//!                       └────────── CloseLatch ─────────┘
//! ```

mod connection;
mod deadline;
mod handoff;
mod inbound;
mod latch;
mod outbound;

use std::time::Duration;

pub use connection::{Connection, ConnectionHandle, ConnectionReport, RelayOptions};
pub use deadline::{DeadlinePolicy, ReadDeadline, WriteDeadline};
pub use handoff::{relay_channel, RelayClosed, RelayReceiver, RelaySender};
pub use inbound::{InboundLoop, InboundReport};
pub use latch::{CloseLatch, CloseReason};
pub use outbound::{OutboundLoop, OutboundReport};

use crate::RelayError;

/// Time allowed to write a single frame to the peer
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next heartbeat acknowledgment from the peer
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Heartbeat probe interval. Must be less than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Maximum inbound payload size in bytes
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Why a relay loop stopped
#[derive(Debug)]
pub enum LoopExit {
    /// The peer sent a close frame or the stream ended
    PeerClosed,
    /// The other loop closed the connection first
    Shutdown(CloseReason),
    /// An I/O, protocol or deadline error ended the loop
    Failed(RelayError),
}

impl LoopExit {
    /// Whether the loop ended because of an error it observed itself
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The error that ended the loop, if any
    #[must_use]
    pub fn error(&self) -> Option<&RelayError> {
        match self {
            Self::Failed(e) => Some(e),
            Self::PeerClosed | Self::Shutdown(_) => None,
        }
    }
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Shutdown(reason) => write!(f, "shutdown ({reason})"),
            Self::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}
