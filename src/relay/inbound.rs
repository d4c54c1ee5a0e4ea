//! Inbound loop: peer frames to the relay channel

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use super::deadline::{DeadlinePolicy, ReadDeadline};
use super::handoff::RelaySender;
use super::latch::{CloseLatch, CloseReason};
use super::LoopExit;
use crate::RelayError;

/// Outcome of one inbound loop
#[derive(Debug)]
pub struct InboundReport {
    /// Payloads received and handed to the relay channel
    pub received: u64,
    /// Heartbeat acknowledgments received
    pub acks: u64,
    /// Why the loop stopped
    pub exit: LoopExit,
}

/// Reads payloads from the peer and forwards them for echoing
///
/// Owns the read deadline. Only heartbeat acknowledgments (pong frames)
/// push it forward; ordinary payloads do not count as liveness. Each payload
/// is written back before the next frame is read.
pub struct InboundLoop<S> {
    conn_id: u64,
    stream: S,
    relay: RelaySender,
    latch: CloseLatch,
    read_deadline: ReadDeadline,
}

impl<S> InboundLoop<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    /// Create an inbound loop over the read half of a transport
    ///
    /// The read deadline is armed immediately at `now + pong_wait`.
    #[must_use]
    pub fn new(
        conn_id: u64,
        stream: S,
        relay: RelaySender,
        latch: CloseLatch,
        policy: &DeadlinePolicy,
    ) -> Self {
        Self {
            conn_id,
            stream,
            relay,
            latch,
            read_deadline: ReadDeadline::new(policy.pong_wait),
        }
    }

    /// Run until the transport fails, the peer closes, or the outbound
    /// loop shuts the connection down
    pub async fn run(mut self) -> InboundReport {
        let mut received = 0u64;
        let mut acks = 0u64;

        let exit = loop {
            let next = tokio::select! {
                biased;
                reason = self.latch.closed() => break LoopExit::Shutdown(reason),
                () = &mut self.read_deadline => {
                    break LoopExit::Failed(RelayError::ReadTimeout(self.read_deadline.window()));
                }
                next = self.stream.next() => next,
            };

            let payload = match next {
                None => break LoopExit::PeerClosed,
                Some(Err(e)) => break LoopExit::Failed(e.into()),
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            "[conn {}] Dropping binary payload that is not UTF-8: {}",
                            self.conn_id, e
                        );
                        continue;
                    }
                },
                Some(Ok(Message::Pong(_))) => {
                    acks += 1;
                    self.read_deadline.refresh();
                    debug!("[conn {}] Heartbeat acknowledged", self.conn_id);
                    continue;
                }
                Some(Ok(Message::Ping(_))) => {
                    debug!("[conn {}] Ping from peer", self.conn_id);
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("[conn {}] Peer sent close: {:?}", self.conn_id, frame);
                    break LoopExit::PeerClosed;
                }
                Some(Ok(Message::Frame(_))) => continue,
            };

            received += 1;
            debug!("[conn {}] Received message: {}", self.conn_id, payload);

            let forwarded = tokio::select! {
                biased;
                reason = self.latch.closed() => Err(reason),
                result = self.relay.relay(payload) => result.map_err(|_| {
                    self.latch.reason().unwrap_or(CloseReason::OutboundEnded)
                }),
            };

            if let Err(reason) = forwarded {
                break LoopExit::Shutdown(reason);
            }
        };

        match &exit {
            LoopExit::Failed(e) if !e.is_disconnect() => {
                warn!("[conn {}] Error when reading message: {}", self.conn_id, e);
            }
            other => debug!("[conn {}] Inbound loop stopped: {}", self.conn_id, other),
        }

        self.latch.close(CloseReason::InboundEnded);

        InboundReport {
            received,
            acks,
            exit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::handoff::{relay_channel, RelayReceiver};
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    type Frame = Result<Message, tungstenite::Error>;

    fn policy() -> DeadlinePolicy {
        DeadlinePolicy::default()
    }

    /// Stand-in for the outbound loop: acknowledges every payload at once
    fn writer(mut rx: RelayReceiver) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut written = Vec::new();
            while let Some(payload) = rx.recv().await {
                written.push(payload);
                rx.written();
            }
            written
        })
    }

    #[tokio::test]
    async fn test_forwards_text_in_order() {
        let (tx, rx) = relay_channel();
        let written = writer(rx);
        let latch = CloseLatch::new();
        let frames = stream::iter::<Vec<Frame>>(vec![
            Ok(Message::Text("one".to_string())),
            Ok(Message::Text("two".to_string())),
            Ok(Message::Binary(b"three".to_vec())),
        ]);

        let report = InboundLoop::new(1, frames, tx, latch.clone(), &policy())
            .run()
            .await;

        assert_eq!(report.received, 3);
        assert!(matches!(report.exit, LoopExit::PeerClosed));
        assert_eq!(written.await.unwrap(), vec!["one", "two", "three"]);
        assert_eq!(latch.reason(), Some(CloseReason::InboundEnded));
    }

    #[tokio::test]
    async fn test_close_frame_stops_loop() {
        let (tx, rx) = relay_channel();
        let written = writer(rx);
        let frames = stream::iter::<Vec<Frame>>(vec![
            Ok(Message::Close(None)),
            Ok(Message::Text("late".to_string())),
        ]);

        let report = InboundLoop::new(1, frames, tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert_eq!(report.received, 0);
        assert!(matches!(report.exit, LoopExit::PeerClosed));
        assert!(written.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_frame_read_only_after_write() {
        let (tx, mut rx) = relay_channel();
        let hello_written = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&hello_written);
        let slow_writer = tokio::spawn(async move {
            let mut written = Vec::new();
            while let Some(payload) = rx.recv().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
                written.push(payload);
                flag.store(true, Ordering::SeqCst);
                rx.written();
            }
            written
        });

        let flag = Arc::clone(&hello_written);
        let frames = stream::unfold(0u32, move |n| {
            let flag = Arc::clone(&flag);
            async move {
                match n {
                    0 => Some((Ok::<_, tungstenite::Error>(Message::Text("hello".to_string())), 1)),
                    1 => {
                        assert!(
                            flag.load(Ordering::SeqCst),
                            "close frame read before the payload was written"
                        );
                        Some((Ok(Message::Close(None)), 2))
                    }
                    _ => None,
                }
            }
        });

        let report = InboundLoop::new(1, Box::pin(frames), tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert_eq!(report.received, 1);
        assert!(matches!(report.exit, LoopExit::PeerClosed));
        assert_eq!(slow_writer.await.unwrap(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_non_utf8_binary_is_skipped() {
        let (tx, rx) = relay_channel();
        let written = writer(rx);
        let frames = stream::iter::<Vec<Frame>>(vec![
            Ok(Message::Binary(vec![0xff, 0xfe])),
            Ok(Message::Text("ok".to_string())),
        ]);

        let report = InboundLoop::new(1, frames, tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert_eq!(report.received, 1);
        assert_eq!(written.await.unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_transport_error_fails_loop() {
        let (tx, _rx) = relay_channel();
        let frames = stream::iter::<Vec<Frame>>(vec![Err(tungstenite::Error::Capacity(
            tungstenite::error::CapacityError::MessageTooLong {
                size: 600,
                max_size: 512,
            },
        ))]);

        let report = InboundLoop::new(1, frames, tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert!(matches!(
            report.exit,
            LoopExit::Failed(RelayError::PayloadTooLarge { size: 600, limit: 512 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (tx, _rx) = relay_channel();
        let start = Instant::now();

        let report = InboundLoop::new(1, stream::pending::<Frame>(), tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert!(matches!(
            report.exit,
            LoopExit::Failed(RelayError::ReadTimeout(_))
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payloads_do_not_refresh_read_deadline() {
        let (tx, rx) = relay_channel();
        let written = writer(rx);
        let start = Instant::now();

        let frames = stream::unfold(0u32, |n| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some((Ok::<_, tungstenite::Error>(Message::Text(format!("msg {n}"))), n + 1))
        });

        let report = InboundLoop::new(1, Box::pin(frames), tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert!(matches!(
            report.exit,
            LoopExit::Failed(RelayError::ReadTimeout(_))
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(written.await.unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_refreshes_read_deadline() {
        let (tx, _rx) = relay_channel();
        let start = Instant::now();

        let acks = stream::unfold(0u32, |n| async move {
            if n == 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(50)).await;
            Some((Ok::<_, tungstenite::Error>(Message::Pong(Vec::new())), n + 1))
        })
        .chain(stream::pending());

        let report = InboundLoop::new(1, Box::pin(acks), tx, CloseLatch::new(), &policy())
            .run()
            .await;

        assert_eq!(report.acks, 3);
        assert!(matches!(
            report.exit,
            LoopExit::Failed(RelayError::ReadTimeout(_))
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(150 + 60));
    }

    #[tokio::test]
    async fn test_unwritten_handoff_released_by_latch() {
        // Receiver stays alive but never reports a write.
        let (tx, _rx) = relay_channel();
        let latch = CloseLatch::new();
        let frames = stream::iter::<Vec<Frame>>(vec![Ok(Message::Text("waits".to_string()))])
            .chain(stream::pending());

        let closer = latch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close(CloseReason::OutboundEnded);
        });

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            InboundLoop::new(1, Box::pin(frames), tx, latch, &policy()).run(),
        )
        .await
        .expect("inbound loop must not hang once the latch is closed");

        assert_eq!(report.received, 1);
        assert!(matches!(
            report.exit,
            LoopExit::Shutdown(CloseReason::OutboundEnded)
        ));
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_loop() {
        let (tx, rx) = relay_channel();
        drop(rx);
        let frames = stream::iter::<Vec<Frame>>(vec![Ok(Message::Text("orphan".to_string()))])
            .chain(stream::pending());

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            InboundLoop::new(1, Box::pin(frames), tx, CloseLatch::new(), &policy()).run(),
        )
        .await
        .unwrap();

        assert!(matches!(
            report.exit,
            LoopExit::Shutdown(CloseReason::OutboundEnded)
        ));
    }
}
