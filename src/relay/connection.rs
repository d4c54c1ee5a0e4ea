//! Connection lifecycle: one transport, one relay channel, two loops

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use super::deadline::DeadlinePolicy;
use super::handoff::relay_channel;
use super::inbound::{InboundLoop, InboundReport};
use super::latch::{CloseLatch, CloseReason};
use super::outbound::{OutboundLoop, OutboundReport};
use super::MAX_MESSAGE_SIZE;
use crate::{RelayError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection relay settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Deadline and heartbeat timings
    pub policy: DeadlinePolicy,
    /// Inbound payload ceiling in bytes
    pub max_message_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            policy: DeadlinePolicy::default(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl RelayOptions {
    /// Transport configuration enforcing the inbound payload ceiling
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Final state of a connection once both loops have exited
#[derive(Debug)]
pub struct ConnectionReport {
    /// Connection identifier
    pub id: u64,
    /// Inbound loop outcome
    pub inbound: InboundReport,
    /// Outbound loop outcome
    pub outbound: OutboundReport,
    /// Time from accept to the last loop exiting
    pub duration: Duration,
}

/// Entry point binding a transport to its relay loops
pub struct Connection;

impl Connection {
    /// Start relaying on an upgraded transport
    ///
    /// Splits the transport, creates the relay hand-off and spawns the
    /// inbound and outbound loops. Returns without waiting for either; the
    /// returned handle may be dropped, in which case the loops run detached.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    pub fn accept<T>(ws: WebSocketStream<T>, options: &RelayOptions) -> ConnectionHandle
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("[conn {}] Initialising connection", id);

        let (sink, stream) = ws.split();
        let (relay_tx, relay_rx) = relay_channel();
        let latch = CloseLatch::new();

        let outbound = tokio::spawn(
            OutboundLoop::new(id, sink, relay_rx, latch.clone(), options.policy).run(),
        );
        let inbound = tokio::spawn(
            InboundLoop::new(id, stream, relay_tx, latch.clone(), &options.policy).run(),
        );

        ConnectionHandle {
            id,
            latch,
            inbound,
            outbound,
            started: Instant::now(),
        }
    }
}

/// Handle to a running connection
pub struct ConnectionHandle {
    id: u64,
    latch: CloseLatch,
    inbound: JoinHandle<InboundReport>,
    outbound: JoinHandle<OutboundReport>,
    started: Instant,
}

impl ConnectionHandle {
    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask both loops to stop
    ///
    /// Returns `false` if the connection was already closing.
    pub fn close(&self) -> bool {
        self.latch.close(CloseReason::Requested)
    }

    /// Whether both loops have exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inbound.is_finished() && self.outbound.is_finished()
    }

    /// Wait for both loops to exit
    ///
    /// # Errors
    ///
    /// Returns error if a loop task panicked or was aborted
    pub async fn wait(self) -> Result<ConnectionReport> {
        let (inbound, outbound) = tokio::join!(self.inbound, self.outbound);

        let inbound =
            inbound.map_err(|e| RelayError::Other(format!("Inbound task failed: {e}")))?;
        let outbound =
            outbound.map_err(|e| RelayError::Other(format!("Outbound task failed: {e}")))?;

        let report = ConnectionReport {
            id: self.id,
            inbound,
            outbound,
            duration: self.started.elapsed(),
        };

        info!(
            "[conn {}] Closed after {:?}: received {}, relayed {}, probes {}, acks {} (inbound {}, outbound {})",
            report.id,
            report.duration,
            report.inbound.received,
            report.outbound.relayed,
            report.outbound.probes,
            report.inbound.acks,
            report.inbound.exit,
            report.outbound.exit,
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::LoopExit;
    use futures_util::SinkExt;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;

    async fn connect(options: &RelayOptions) -> (ConnectionHandle, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server =
            WebSocketStream::from_raw_socket(server_io, Role::Server, Some(options.websocket_config()))
                .await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        (Connection::accept(server, options), client)
    }

    async fn next_text(client: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_exactly_once_in_order() {
        let options = RelayOptions::default();
        let (handle, mut client) = connect(&options).await;

        client.send(Message::Text("hello".to_string())).await.unwrap();
        for i in 0..50 {
            client.send(Message::Text(format!("msg {i}"))).await.unwrap();
        }

        assert_eq!(next_text(&mut client).await, "hello");
        for i in 0..50 {
            assert_eq!(next_text(&mut client).await, format!("msg {i}"));
        }

        client.close(None).await.unwrap();
        while let Some(Ok(msg)) = client.next().await {
            assert!(!msg.is_text(), "unexpected extra payload: {msg:?}");
        }

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.inbound.received, 51);
        assert_eq!(report.outbound.relayed, 51);
        assert!(matches!(report.inbound.exit, LoopExit::PeerClosed));
    }

    #[tokio::test]
    async fn test_payload_before_close_is_echoed() {
        let options = RelayOptions::default();
        let (handle, mut client) = connect(&options).await;

        client.send(Message::Text("hello".to_string())).await.unwrap();
        client.close(None).await.unwrap();

        let mut echoed = Vec::new();
        while let Some(Ok(msg)) = client.next().await {
            if let Message::Text(text) = msg {
                echoed.push(text);
            }
        }

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(echoed, vec!["hello".to_string()]);
        assert_eq!(report.inbound.received, 1);
        assert_eq!(report.outbound.relayed, 1);
        assert!(matches!(report.inbound.exit, LoopExit::PeerClosed));
        assert!(matches!(
            report.outbound.exit,
            LoopExit::Shutdown(CloseReason::InboundEnded)
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_closes_without_echo() {
        let options = RelayOptions::default();
        let (handle, mut client) = connect(&options).await;

        client.send(Message::Text("x".repeat(513))).await.unwrap();

        while let Some(Ok(msg)) = client.next().await {
            assert!(!msg.is_text(), "oversized payload was relayed: {msg:?}");
        }

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outbound.relayed, 0);
        assert!(matches!(
            report.inbound.exit,
            LoopExit::Failed(RelayError::PayloadTooLarge { limit: 512, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_disconnected_after_pong_wait() {
        let options = RelayOptions::default();
        let (handle, _client) = connect(&options).await;
        let start = Instant::now();

        let report = handle.wait().await.unwrap();

        assert!(matches!(
            report.inbound.exit,
            LoopExit::Failed(RelayError::ReadTimeout(_))
        ));
        assert!(matches!(
            report.outbound.exit,
            LoopExit::Shutdown(CloseReason::InboundEnded)
        ));
        assert_eq!(report.outbound.probes, 1);
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledging_peer_stays_connected() {
        let options = RelayOptions::default();
        let (handle, mut client) = connect(&options).await;

        // Reading lets the client answer each probe with a pong.
        let reader = tokio::spawn(async move { while let Some(Ok(_)) = client.next().await {} });

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!handle.is_finished());

        assert!(handle.close());
        let report = handle.wait().await.unwrap();

        assert_eq!(report.outbound.probes, 3);
        assert_eq!(report.inbound.acks, 3);
        assert!(matches!(
            report.inbound.exit,
            LoopExit::Shutdown(CloseReason::Requested)
        ));
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_ends_both_loops() {
        let options = RelayOptions::default();
        let (handle, client) = connect(&options).await;

        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        match &report.inbound.exit {
            LoopExit::PeerClosed => {}
            LoopExit::Failed(e) => assert!(e.is_disconnect(), "unexpected error: {e}"),
            LoopExit::Shutdown(reason) => panic!("inbound should see the disconnect, got {reason}"),
        }
        assert!(matches!(
            report.outbound.exit,
            LoopExit::Shutdown(CloseReason::InboundEnded)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let options = RelayOptions::default();
        let (handle, _client) = connect(&options).await;

        assert!(handle.close());
        assert!(!handle.close());

        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            report.outbound.exit,
            LoopExit::Shutdown(CloseReason::Requested)
        ));
    }

    #[test]
    fn test_websocket_config_carries_ceiling() {
        let options = RelayOptions {
            max_message_size: 1024,
            ..RelayOptions::default()
        };
        let config = options.websocket_config();

        assert_eq!(config.max_message_size, Some(1024));
        assert_eq!(config.max_frame_size, Some(1024));
    }
}
