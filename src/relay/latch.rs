//! Single-use close latch shared by both relay loops

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Who closed the connection first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The inbound loop stopped reading
    InboundEnded,
    /// The outbound loop stopped writing
    OutboundEnded,
    /// Closed through a `ConnectionHandle`
    Requested,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InboundEnded => write!(f, "inbound ended"),
            Self::OutboundEnded => write!(f, "outbound ended"),
            Self::Requested => write!(f, "close requested"),
        }
    }
}

/// Idempotent close signal for one connection
///
/// The first call to [`CloseLatch::close`] wins; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct CloseLatch {
    state: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseLatch {
    /// Create an open latch
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Close the latch
    ///
    /// Returns `true` only for the caller that actually closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        })
    }

    /// Whether any party has closed the latch
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Reason recorded by the first closer
    #[must_use]
    pub fn reason(&self) -> Option<CloseReason> {
        *self.state.borrow()
    }

    /// Wait until the latch is closed
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|state| *state);
        match result {
            Ok(Some(reason)) => reason,
            // The sender lives as long as `self`, so the wait cannot fail.
            _ => CloseReason::Requested,
        }
    }
}

impl Default for CloseLatch {
    fn default() -> Self {
        Self::new()
    }
}
