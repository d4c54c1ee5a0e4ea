//! Outbound loop: relay channel and heartbeat probes to the peer

use futures_util::{Sink, SinkExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::deadline::{DeadlinePolicy, WriteDeadline};
use super::handoff::RelayReceiver;
use super::latch::{CloseLatch, CloseReason};
use super::LoopExit;
use crate::RelayError;

/// Outcome of one outbound loop
#[derive(Debug)]
pub struct OutboundReport {
    /// Payloads written back to the peer
    pub relayed: u64,
    /// Heartbeat probes written
    pub probes: u64,
    /// Why the loop stopped
    pub exit: LoopExit,
}

/// Sole writer of a connection
///
/// Services one event per iteration: either a relayed payload or a
/// heartbeat tick, so writes never overlap.
pub struct OutboundLoop<K> {
    conn_id: u64,
    sink: K,
    relay: RelayReceiver,
    latch: CloseLatch,
    policy: DeadlinePolicy,
}

impl<K> OutboundLoop<K>
where
    K: Sink<Message> + Unpin,
    K::Error: Into<RelayError>,
{
    /// Create an outbound loop over the write half of a transport
    #[must_use]
    pub fn new(
        conn_id: u64,
        sink: K,
        relay: RelayReceiver,
        latch: CloseLatch,
        policy: DeadlinePolicy,
    ) -> Self {
        Self {
            conn_id,
            sink,
            relay,
            latch,
            policy,
        }
    }

    /// Run until a write fails or the connection is closed
    ///
    /// On exit the heartbeat timer is dropped and the sink is closed once.
    pub async fn run(mut self) -> OutboundReport {
        let period = self.policy.ping_period;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut write_deadline = WriteDeadline::new(self.policy.write_wait);
        let mut relayed = 0u64;
        let mut probes = 0u64;

        let exit = loop {
            tokio::select! {
                biased;
                reason = self.latch.closed() => break LoopExit::Shutdown(reason),
                payload = self.relay.recv() => {
                    let Some(payload) = payload else {
                        let reason = self.latch.reason().unwrap_or(CloseReason::InboundEnded);
                        break LoopExit::Shutdown(reason);
                    };

                    debug!("[conn {}] Writing: {}", self.conn_id, payload);
                    write_deadline.refresh();
                    if let Err(e) = write_deadline.run(self.sink.send(Message::Text(payload))).await {
                        break LoopExit::Failed(e);
                    }
                    self.relay.written();
                    relayed += 1;
                }
                _ = heartbeat.tick() => {
                    debug!("[conn {}] Sending ping", self.conn_id);
                    write_deadline.refresh();
                    if let Err(e) = write_deadline.run(self.sink.send(Message::Ping(Vec::new()))).await {
                        break LoopExit::Failed(e);
                    }
                    probes += 1;
                }
            }
        };

        drop(heartbeat);

        match &exit {
            LoopExit::Failed(e) if !e.is_disconnect() => {
                warn!("[conn {}] Error when writing message: {}", self.conn_id, e);
            }
            other => debug!("[conn {}] Outbound loop stopped: {}", self.conn_id, other),
        }

        self.latch.close(CloseReason::OutboundEnded);

        write_deadline.refresh();
        if let Err(e) = write_deadline.run(self.sink.close()).await {
            debug!("[conn {}] Close after shutdown: {}", self.conn_id, e);
        }

        OutboundReport {
            relayed,
            probes,
            exit,
        }
    }
}
