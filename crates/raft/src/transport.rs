//! Overlay transport for Raft messages
//!
//! This module carries raft-rs `eraftpb::Message` values over the overlay's
//! best-effort packet connection. Each frame is the protobuf encoding of one
//! message, so a frame is self-contained and loss, duplication or reordering
//! only ever affects whole messages, which raft-rs tolerates.
//!
//! # Architecture
//!
//! Each node runs:
//! - **1 outbound loop**: drains the controller's outgoing queue, resolves
//!   the destination uid through a [`PeerTranslator`] and sends the frame
//! - **1 inbound loop**: receives frames, decodes them and pushes them onto
//!   the controller's incoming queue
//!
//! A message that cannot be delivered is dropped and its destination is
//! reported on the unreachable queue. That queue is bounded and lossy: when
//! it is full the notification is discarded.

use crate::translator::PeerTranslator;
use bytes::Bytes;
use meshkv_common::{NodeId, PeerUid};
use meshkv_overlay::{OverlayError, PacketConn};
use prost::Message as _;
use raft::eraftpb::Message;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in the transport layer
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("peer {0:x} is not known to the overlay")]
    UnknownPeer(PeerUid),

    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Message decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Encodes a Raft message into one overlay frame.
pub fn encode_message(msg: &Message) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}

/// Decodes an overlay frame back into a Raft message.
///
/// # Errors
///
/// Returns `TransportError::Decode` if the frame is not a valid encoding.
pub fn decode_message(frame: &[u8]) -> Result<Message, TransportError> {
    Ok(Message::decode(frame)?)
}

/// Pause after a failed receive before trying again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Running transport: both loops plus the means to stop them.
pub struct PacketTransport {
    conn: Arc<dyn PacketConn>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketTransport {
    /// Spawns the outbound and inbound loops.
    pub fn start(
        node: NodeId,
        conn: Arc<dyn PacketConn>,
        translator: Arc<dyn PeerTranslator>,
        incoming_tx: mpsc::Sender<Message>,
        outgoing_rx: mpsc::Receiver<Message>,
        unreachable_tx: mpsc::Sender<PeerUid>,
    ) -> Self {
        let cancel = CancellationToken::new();

        let outbound = tokio::spawn(outbound_loop(
            node,
            conn.clone(),
            translator,
            outgoing_rx,
            unreachable_tx,
            cancel.clone(),
        ));
        let inbound = tokio::spawn(inbound_loop(
            node,
            conn.clone(),
            incoming_tx,
            cancel.clone(),
        ));

        Self {
            conn,
            cancel,
            tasks: Mutex::new(vec![outbound, inbound]),
        }
    }

    /// Closes the connection and waits for both loops to exit.
    ///
    /// Idempotent. Once it returns no frame is sent and no message is pushed
    /// onto the incoming queue.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.conn.close();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "transport task failed");
            }
        }
    }
}

async fn outbound_loop(
    node: NodeId,
    conn: Arc<dyn PacketConn>,
    translator: Arc<dyn PeerTranslator>,
    mut outgoing_rx: mpsc::Receiver<Message>,
    unreachable_tx: mpsc::Sender<PeerUid>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = outgoing_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let to = msg.to;

        let result = match translator.translate(to) {
            Ok(name) => {
                let frame = encode_message(&msg);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = conn.send_to(frame, name) => sent.map_err(TransportError::from),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::debug!(node = %format!("{node:x}"), peer = %format!("{to:x}"), error = %e, "dropping raft message");
            if unreachable_tx.try_send(to).is_err() {
                tracing::warn!(node = %format!("{node:x}"), peer = %format!("{to:x}"), "unreachable queue full, notification shed");
            }
        }
    }
    tracing::debug!(node = %format!("{node:x}"), "transport outbound loop stopped");
}

async fn inbound_loop(
    node: NodeId,
    conn: Arc<dyn PacketConn>,
    incoming_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let (frame, from) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = conn.recv_from() => match packet {
                Ok(packet) => packet,
                Err(OverlayError::Closed) => break,
                Err(e) => {
                    tracing::warn!(node = %format!("{node:x}"), error = %e, "overlay receive failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            },
        };

        let msg = match decode_message(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(node = %format!("{node:x}"), from = %format!("{from:x}"), error = %e, "discarding malformed frame");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = incoming_tx.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(node = %format!("{node:x}"), "transport inbound loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::TopologyTranslator;
    use meshkv_common::PeerName;
    use meshkv_overlay::{FaultPlan, MemoryMesh, MemoryPeer, OverlayConfig};
    use raft::eraftpb::MessageType;

    fn heartbeat(from: u64, to: u64, term: u64) -> Message {
        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.from = from;
        msg.to = to;
        msg.term = term;
        msg
    }

    struct Harness {
        transport: PacketTransport,
        outgoing_tx: mpsc::Sender<Message>,
        incoming_rx: mpsc::Receiver<Message>,
        unreachable_rx: mpsc::Receiver<PeerUid>,
    }

    fn start(peer: Arc<MemoryPeer>, unreachable_capacity: usize) -> Harness {
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(64);
        let (unreachable_tx, unreachable_rx) = mpsc::channel(unreachable_capacity);
        let translator = Arc::new(TopologyTranslator::new(peer.clone()));
        let transport = PacketTransport::start(
            peer.identity().uid,
            peer,
            translator,
            incoming_tx,
            outgoing_rx,
            unreachable_tx,
        );
        Harness {
            transport,
            outgoing_tx,
            incoming_rx,
            unreachable_rx,
        }
    }

    #[test]
    fn test_message_frame_round_trip() {
        let mut msg = heartbeat(1, 2, 5);
        msg.commit = 42;

        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded.get_msg_type(), MessageType::MsgHeartbeat);
        assert_eq!(decoded.from, 1);
        assert_eq!(decoded.to, 2);
        assert_eq!(decoded.commit, 42);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_message(&[0xff, 0xff, 0xff]),
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_cross_the_overlay() {
        let mesh = MemoryMesh::new();
        let a = Arc::new(mesh.join(&OverlayConfig::default(), 1, "a").unwrap());
        let b = Arc::new(mesh.join(&OverlayConfig::default(), 2, "b").unwrap());
        let (a_uid, b_uid) = (a.identity().uid, b.identity().uid);

        let ha = start(a, 16);
        let mut hb = start(b, 16);

        ha.outgoing_tx.send(heartbeat(a_uid, b_uid, 3)).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), hb.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(received.from, a_uid);
        assert_eq!(received.term, 3);

        ha.transport.stop().await;
        hb.transport.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_destination_reports_unreachable() {
        let mesh = MemoryMesh::new();
        let a = Arc::new(mesh.join(&OverlayConfig::default(), 1, "a").unwrap());
        let a_uid = a.identity().uid;
        let mut ha = start(a, 16);

        ha.outgoing_tx.send(heartbeat(a_uid, 0xdead, 1)).await.unwrap();
        let uid = tokio::time::timeout(Duration::from_secs(1), ha.unreachable_rx.recv())
            .await
            .unwrap();

        assert_eq!(uid, Some(0xdead));
        ha.transport.stop().await;
    }

    #[tokio::test]
    async fn test_full_unreachable_queue_sheds() {
        let mesh = MemoryMesh::new();
        let a = Arc::new(mesh.join(&OverlayConfig::default(), 1, "a").unwrap());
        let a_uid = a.identity().uid;
        let mut ha = start(a, 1);

        for to in [0x10, 0x20, 0x30] {
            ha.outgoing_tx.send(heartbeat(a_uid, to, 1)).await.unwrap();
        }
        // the loop keeps running after shedding
        tokio::time::sleep(Duration::from_millis(50)).await;
        ha.transport.stop().await;

        assert_eq!(ha.unreachable_rx.recv().await, Some(0x10));
        assert_eq!(ha.unreachable_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_inbound_loop() {
        let mesh = MemoryMesh::new();
        let a = mesh.join(&OverlayConfig::default(), 1, "a").unwrap();
        let b = Arc::new(mesh.join(&OverlayConfig::default(), 2, "b").unwrap());
        let (a_uid, b_uid) = (a.identity().uid, b.identity().uid);
        let mut hb = start(b, 16);

        a.send_to(Bytes::from_static(&[0xff, 0xff, 0xff]), 2)
            .await
            .unwrap();
        a.send_to(encode_message(&heartbeat(a_uid, b_uid, 9)), 2)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), hb.incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.term, 9);
        hb.transport.stop().await;
    }

    #[tokio::test]
    async fn test_lossy_overlay_keeps_loops_alive() {
        let mesh = MemoryMesh::new();
        let a = Arc::new(mesh.join(&OverlayConfig::default(), 1, "a").unwrap());
        let b = Arc::new(mesh.join(&OverlayConfig::default(), 2, "b").unwrap());
        let (a_uid, b_uid) = (a.identity().uid, b.identity().uid);
        mesh.set_faults(FaultPlan {
            drop_every: 3,
            duplicate_every: 4,
        });

        let ha = start(a, 16);
        let mut hb = start(b, 16);

        for term in 1..=12 {
            ha.outgoing_tx
                .send(heartbeat(a_uid, b_uid, term))
                .await
                .unwrap();
        }

        // 12 sends: 4 dropped (3, 6, 9, 12), 2 duplicated (4, 8)
        let mut terms = Vec::new();
        for _ in 0..10 {
            let msg = tokio::time::timeout(Duration::from_secs(1), hb.incoming_rx.recv())
                .await
                .unwrap()
                .unwrap();
            terms.push(msg.term);
        }
        assert_eq!(terms, vec![1, 2, 4, 4, 5, 7, 8, 8, 10, 11]);

        ha.transport.stop().await;
        hb.transport.stop().await;
    }

    #[tokio::test]
    async fn test_no_output_after_stop() {
        let mesh = MemoryMesh::new();
        let a = mesh.join(&OverlayConfig::default(), 1, "a").unwrap();
        let b = Arc::new(mesh.join(&OverlayConfig::default(), 2, "b").unwrap());
        let (a_uid, b_uid) = (a.identity().uid, b.identity().uid);
        let mut hb = start(b, 16);

        hb.transport.stop().await;
        hb.transport.stop().await;

        // the connection is closed, frames sent to it go nowhere
        let _ = a.send_to(encode_message(&heartbeat(a_uid, b_uid, 1)), 2).await;
        assert_eq!(hb.incoming_rx.recv().await.map(|m| m.term), None);

        // the outbound loop is gone too
        assert!(hb.outgoing_tx.send(heartbeat(b_uid, a_uid, 1)).await.is_err());
        assert!(hb.unreachable_rx.recv().await.is_none());
    }

    /// A connection whose every receive fails, counting the attempts.
    #[derive(Default)]
    struct FailingConn {
        receives: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PacketConn for FailingConn {
        async fn send_to(&self, _payload: Bytes, _to: PeerName) -> Result<(), OverlayError> {
            Ok(())
        }

        async fn recv_from(&self) -> Result<(Bytes, PeerName), OverlayError> {
            self.receives
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(OverlayError::UnknownPeer(0))
        }

        fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_receive_backs_off() {
        let conn = Arc::new(FailingConn::default());
        let (incoming_tx, _incoming_rx) = mpsc::channel(4);
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(4);
        let (unreachable_tx, _unreachable_rx) = mpsc::channel(4);
        let translator = Arc::new(|uid: PeerUid| -> Result<PeerName, TransportError> { Ok(uid) });
        let transport = PacketTransport::start(
            1,
            conn.clone(),
            translator,
            incoming_tx,
            outgoing_rx,
            unreachable_tx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let receives = conn.receives.load(std::sync::atomic::Ordering::Relaxed);
        assert!(receives >= 2, "receive should be retried, got {receives}");
        assert!(receives <= 12, "receive retried without pause: {receives} attempts");

        tokio::time::timeout(Duration::from_secs(1), transport.stop())
            .await
            .expect("stop must interrupt the backoff");
    }
}
