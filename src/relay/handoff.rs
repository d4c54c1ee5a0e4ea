//! Rendezvous hand-off from the inbound loop to the outbound loop
//!
//! A payload counts as delivered only once the writer has put it on the
//! wire. The reader waits for that before reading the next frame, so a
//! close frame from the peer can never overtake a payload it sent earlier.

use tokio::sync::{mpsc, watch};

/// The other side of the hand-off is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayClosed;

impl std::fmt::Display for RelayClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay channel closed")
    }
}

impl std::error::Error for RelayClosed {}

/// Create a connected sender/receiver pair
#[must_use]
pub fn relay_channel() -> (RelaySender, RelayReceiver) {
    let (payload_tx, payload_rx) = mpsc::channel(1);
    let (written_tx, written_rx) = watch::channel(0u64);

    (
        RelaySender {
            payloads: payload_tx,
            written: written_rx,
            sent: 0,
        },
        RelayReceiver {
            payloads: payload_rx,
            written: written_tx,
        },
    )
}

/// Reader's end: hands payloads over one at a time
#[derive(Debug)]
pub struct RelaySender {
    payloads: mpsc::Sender<String>,
    written: watch::Receiver<u64>,
    sent: u64,
}

impl RelaySender {
    /// Hand a payload to the writer and wait until it has been written
    ///
    /// # Errors
    ///
    /// Returns `RelayClosed` if the writer stopped before writing it
    pub async fn relay(&mut self, payload: String) -> Result<(), RelayClosed> {
        self.payloads.send(payload).await.map_err(|_| RelayClosed)?;
        self.sent += 1;

        let sent = self.sent;
        self.written
            .wait_for(|&written| written >= sent)
            .await
            .map(|_| ())
            .map_err(|_| RelayClosed)
    }
}

/// Writer's end
#[derive(Debug)]
pub struct RelayReceiver {
    payloads: mpsc::Receiver<String>,
    written: watch::Sender<u64>,
}

impl RelayReceiver {
    /// Next payload, or `None` once the reader is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.payloads.recv().await
    }

    /// Report the last received payload as written, releasing the reader
    pub fn written(&self) {
        self.written.send_modify(|written| *written += 1);
    }
}
