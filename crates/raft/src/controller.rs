//! The controller task: sole owner of the consensus engine.
//!
//! The controller runs one loop that ticks the [`RaftNode`], feeds it
//! incoming messages, unreachable hints and proposals, and dispatches every
//! round of ready output onto the component queues. No other task touches
//! the engine, so it needs no locking.

use crate::config::RaftConfig;
use crate::node::{RaftNode, ReadyOutput};
use crate::types::{Committed, ConfigChange, ControllerState, ControllerStatus, SnapshotData};
use meshkv_common::{Error, NodeId, PeerUid, Result};
use raft::eraftpb::{Message, MessageType};
use raft::SnapshotStatus;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// The queue ends the controller owns.
pub struct ControllerChannels {
    /// Messages received from other peers.
    pub incoming_rx: mpsc::Receiver<Message>,
    /// Messages for the packet transport to send.
    pub outgoing_tx: mpsc::Sender<Message>,
    /// Peers the transport failed to reach.
    pub unreachable_rx: mpsc::Receiver<PeerUid>,
    /// Membership changes from the configurator.
    pub conf_change_rx: mpsc::Receiver<ConfigChange>,
    /// Applied membership changes, back to the configurator.
    pub conf_entry_tx: mpsc::Sender<ConfigChange>,
    /// Encoded writes from the store.
    pub proposal_rx: mpsc::Receiver<Vec<u8>>,
    /// Committed writes and installed snapshots, for the store.
    pub entry_tx: mpsc::Sender<Committed>,
    /// Store snapshots to compact the log with.
    pub snapshot_rx: mpsc::Receiver<SnapshotData>,
    /// Asks the store for a fresh snapshot.
    pub snapshot_request_tx: mpsc::Sender<()>,
}

/// Handle on the running controller task.
pub struct Controller {
    id: NodeId,
    status_tx: Arc<watch::Sender<ControllerStatus>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Creates the engine and spawns the controller loop.
    ///
    /// `initial_peers` is the bootstrap decision: the voters of a new
    /// cluster, or empty to join an existing one. `terminated_tx` fires once
    /// if the loop ends on its own: with `RemovedFromCluster` when a
    /// committed change removes this node, or with the error that broke the
    /// engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be created from `config`.
    pub fn start(
        id: NodeId,
        initial_peers: &[NodeId],
        config: &RaftConfig,
        channels: ControllerChannels,
        terminated_tx: oneshot::Sender<Error>,
    ) -> Result<Self> {
        let node = RaftNode::new(id, initial_peers, config)?;
        tracing::info!(
            node = %format!("{id:x}"),
            peers = initial_peers.len(),
            "starting controller"
        );
        Ok(Self::spawn(node, config, channels, terminated_tx))
    }

    fn spawn(
        node: RaftNode,
        config: &RaftConfig,
        channels: ControllerChannels,
        terminated_tx: oneshot::Sender<Error>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ControllerStatus::starting());
        let status_tx = Arc::new(status_tx);
        let id = node.id();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            node,
            config.tick_interval(),
            channels,
            terminated_tx,
            status_tx.clone(),
            cancel.clone(),
        ));

        Self {
            id,
            status_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status_tx.borrow().clone()
    }

    /// Subscribes to status updates; one is published per loop iteration
    /// that changed anything.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Halts ticking and drops the engine.
    ///
    /// Idempotent. Must be called after the store has stopped.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(node = %format!("{:x}", self.id), error = %e, "controller task failed");
            }
            tracing::info!(node = %format!("{:x}", self.id), "controller stopped");
        }
        self.status_tx.send_modify(|status| status.state = ControllerState::Stopped);
    }
}

async fn run(
    mut node: RaftNode,
    tick_interval: std::time::Duration,
    mut channels: ControllerChannels,
    terminated_tx: oneshot::Sender<Error>,
    status_tx: Arc<watch::Sender<ControllerStatus>>,
    cancel: CancellationToken,
) {
    let id = node.id();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    publish(&status_tx, &node, ControllerState::Running);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => node.tick(),
            Some(msg) = channels.incoming_rx.recv() => {
                step(&mut node, msg);
                while let Ok(msg) = channels.incoming_rx.try_recv() {
                    step(&mut node, msg);
                }
            }
            Some(uid) = channels.unreachable_rx.recv() => {
                node.report_unreachable(uid);
                while let Ok(uid) = channels.unreachable_rx.try_recv() {
                    node.report_unreachable(uid);
                }
            }
            Some(change) = channels.conf_change_rx.recv() => {
                if let Err(e) = node.propose_conf_change(change) {
                    tracing::debug!(node = %format!("{id:x}"), error = %e, "configuration change will be retried");
                }
            }
            Some(data) = channels.proposal_rx.recv() => {
                if let Err(e) = node.propose(data) {
                    tracing::debug!(node = %format!("{id:x}"), error = %e, "proposal dropped");
                }
            }
            Some(snapshot) = channels.snapshot_rx.recv() => {
                if let Err(e) = node.compact(snapshot) {
                    tracing::warn!(node = %format!("{id:x}"), error = %e, "log compaction failed");
                }
            }
        }

        let out = match node.handle_ready() {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(node = %format!("{id:x}"), error = %e, "ready handling failed, stopping");
                terminate(&node, terminated_tx, e, &status_tx);
                return;
            }
        };
        let removed = out.removed;
        if out.snapshot_wanted {
            // a full queue already holds a request
            let _ = channels.snapshot_request_tx.try_send(());
        }
        if !out.is_empty() && !dispatch(&mut node, out, &channels, &cancel).await {
            break;
        }

        if removed {
            terminate(&node, terminated_tx, Error::RemovedFromCluster, &status_tx);
            return;
        }
        publish(&status_tx, &node, ControllerState::Running);
    }

    publish(&status_tx, &node, ControllerState::Stopping);
}

/// Ends the loop on its own: reports `outcome` and publishes `Stopping`.
fn terminate(
    node: &RaftNode,
    terminated_tx: oneshot::Sender<Error>,
    outcome: Error,
    status_tx: &watch::Sender<ControllerStatus>,
) {
    publish(status_tx, node, ControllerState::Stopping);
    let _ = terminated_tx.send(outcome);
}

fn step(node: &mut RaftNode, msg: Message) {
    let from = msg.from;
    if let Err(e) = node.step(msg) {
        tracing::debug!(node = %format!("{:x}", node.id()), from = %format!("{from:x}"), error = %e, "message rejected");
    }
}

/// Moves ready output onto the queues. Committed output goes out in commit
/// order. Returns false if the controller was cancelled meanwhile.
///
/// A snapshot handed to the transport is reported finished. Losing it on the
/// way surfaces later as an unreachable report, which fails it.
async fn dispatch(
    node: &mut RaftNode,
    out: ReadyOutput,
    channels: &ControllerChannels,
    cancel: &CancellationToken,
) -> bool {
    let id = node.id();
    for msg in out.messages {
        let to = msg.to;
        let snapshot = msg.get_msg_type() == MessageType::MsgSnapshot;
        match forward(&channels.outgoing_tx, msg, cancel).await {
            None => return false,
            Some(false) => {
                tracing::debug!(node = %format!("{id:x}"), "transport gone, message dropped");
                if snapshot {
                    node.report_snapshot(to, SnapshotStatus::Failure);
                }
            }
            Some(true) => {
                if snapshot {
                    tracing::debug!(node = %format!("{id:x}"), to = %format!("{to:x}"), "snapshot sent");
                    node.report_snapshot(to, SnapshotStatus::Finish);
                }
            }
        }
    }

    for committed in out.committed {
        let sent = match committed {
            Committed::ConfChange(change) => {
                forward(&channels.conf_entry_tx, change, cancel).await
            }
            other => forward(&channels.entry_tx, other, cancel).await,
        };
        match sent {
            None => return false,
            Some(false) => tracing::debug!(node = %format!("{id:x}"), "consumer gone, committed output dropped"),
            Some(true) => {}
        }
    }
    true
}

/// Sends unless cancelled first. `None` means cancelled, `Some(false)` that
/// the receiver is gone.
async fn forward<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> Option<bool> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        sent = tx.send(value) => Some(sent.is_ok()),
    }
}

fn publish(status_tx: &watch::Sender<ControllerStatus>, node: &RaftNode, state: ControllerState) {
    let status = ControllerStatus {
        state,
        role: node.role(),
        leader_id: node.leader_id(),
        term: node.term(),
        applied: node.applied(),
    };
    status_tx.send_if_modified(|current| {
        if *current == status {
            return false;
        }
        *current = status;
        true
    });
}
