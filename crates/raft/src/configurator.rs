//! Serializes membership events into configuration-change proposals.
//!
//! raft-rs accepts only one simple configuration change in flight at a time.
//! The configurator keeps at most one change outstanding and queues the rest
//! until the outstanding one is seen applied.

use crate::types::ConfigChange;
use meshkv_common::NodeId;
use meshkv_overlay::PeerIdentity;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pending membership changes with at most one outstanding.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    outstanding: Option<ConfigChange>,
    queued: VecDeque<ConfigChange>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a change. Returns it if it should be proposed now, which is the
    /// case only when nothing is outstanding.
    ///
    /// A change that edits the same peer in the same direction as the
    /// outstanding or an already queued one is ignored.
    pub fn push(&mut self, change: ConfigChange) -> Option<ConfigChange> {
        let duplicate = self.outstanding.iter().chain(self.queued.iter()).any(|c| c.same_edit(&change));
        if duplicate {
            return None;
        }
        if self.outstanding.is_none() {
            self.outstanding = Some(change);
            return Some(change);
        }
        self.queued.push_back(change);
        None
    }

    /// Records an applied change. If it settles the outstanding change, the
    /// next queued one becomes outstanding and is returned for proposal.
    ///
    /// Changes committed on behalf of another node count as well; a queued
    /// change they settle is dropped.
    pub fn applied(&mut self, change: &ConfigChange) -> Option<ConfigChange> {
        self.queued.retain(|c| !c.same_edit(change));

        match self.outstanding {
            Some(outstanding) if outstanding.same_edit(change) => {
                self.outstanding = self.queued.pop_front();
                self.outstanding
            }
            _ => None,
        }
    }

    pub fn outstanding(&self) -> Option<ConfigChange> {
        self.outstanding
    }

    /// Number of changes not yet applied, the outstanding one included.
    pub fn len(&self) -> usize {
        self.queued.len() + usize::from(self.outstanding.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Queue ends the configurator reads from and writes to.
pub struct ConfiguratorChannels {
    pub add_rx: mpsc::Receiver<PeerIdentity>,
    pub remove_rx: mpsc::Receiver<PeerIdentity>,
    /// To the controller; capacity 1 is enough.
    pub conf_change_tx: mpsc::Sender<ConfigChange>,
    /// Applied changes from the controller, in commit order.
    pub conf_entry_rx: mpsc::Receiver<ConfigChange>,
}

/// Handle on the running configurator task.
pub struct Configurator {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Configurator {
    pub fn start(node: NodeId, channels: ConfiguratorChannels) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(node, channels, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops the loop and drops whatever was pending.
    ///
    /// Idempotent; no change is proposed after it returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "configurator task failed");
            }
        }
    }
}

async fn run(node: NodeId, channels: ConfiguratorChannels, cancel: CancellationToken) {
    let ConfiguratorChannels {
        mut add_rx,
        mut remove_rx,
        conf_change_tx,
        mut conf_entry_rx,
    } = channels;

    let mut queue = ChangeQueue::new();
    let mut next_id = 1u64;
    let mut to_send: Option<ConfigChange> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = conf_change_tx.reserve(), if to_send.is_some() => {
                match (permit, to_send.take()) {
                    (Ok(permit), Some(change)) => {
                        tracing::info!(node = %format!("{node:x}"), peer = %format!("{:x}", change.peer.uid), kind = ?change.kind, "proposing configuration change");
                        permit.send(change);
                    }
                    (Err(_), _) => break,
                    (Ok(_), None) => {}
                }
                None
            }
            Some(peer) = add_rx.recv() => {
                next_id += 1;
                queue.push(ConfigChange::add(next_id, peer))
            }
            Some(peer) = remove_rx.recv() => {
                next_id += 1;
                queue.push(ConfigChange::remove(next_id, peer))
            }
            Some(change) = conf_entry_rx.recv() => queue.applied(&change),
            else => break,
        };

        if let Some(change) = next {
            to_send = Some(change);
        }
    }

    if !queue.is_empty() {
        tracing::debug!(node = %format!("{node:x}"), dropped = queue.len(), "configurator stopped with pending changes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use proptest::prelude::*;
    use std::time::Duration;

    fn peer(uid: u64) -> PeerIdentity {
        PeerIdentity { uid, name: uid + 1000 }
    }

    #[test]
    fn test_first_change_is_proposed_immediately() {
        let mut queue = ChangeQueue::new();
        let change = ConfigChange::add(1, peer(1));

        assert_eq!(queue.push(change), Some(change));
        assert_eq!(queue.outstanding(), Some(change));
    }

    #[test]
    fn test_later_changes_wait_for_apply() {
        let mut queue = ChangeQueue::new();
        let first = ConfigChange::add(1, peer(1));
        let second = ConfigChange::remove(2, peer(2));

        queue.push(first);
        assert_eq!(queue.push(second), None);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.applied(&first), Some(second));
        assert_eq!(queue.applied(&second), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut queue = ChangeQueue::new();
        queue.push(ConfigChange::add(1, peer(1)));
        queue.push(ConfigChange::add(2, peer(2)));

        assert_eq!(queue.push(ConfigChange::add(3, peer(1))), None);
        assert_eq!(queue.push(ConfigChange::add(4, peer(2))), None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_unrelated_apply_keeps_outstanding() {
        let mut queue = ChangeQueue::new();
        let change = ConfigChange::add(1, peer(1));
        queue.push(change);

        assert_eq!(queue.applied(&ConfigChange::add(9, peer(9))), None);
        assert_eq!(queue.applied(&ConfigChange::remove(9, peer(1))), None);
        assert_eq!(queue.outstanding(), Some(change));
    }

    #[test]
    fn test_apply_from_other_node_settles_queued_change() {
        let mut queue = ChangeQueue::new();
        let first = ConfigChange::add(1, peer(1));
        queue.push(first);
        queue.push(ConfigChange::add(2, peer(2)));
        let third = ConfigChange::add(3, peer(3));
        queue.push(third);

        // someone else got peer 2 committed first
        queue.applied(&ConfigChange::add(77, peer(2)));
        assert_eq!(queue.applied(&first), Some(third));
    }

    proptest! {
        #[test]
        fn prop_at_most_one_outstanding(
            ops in prop::collection::vec((any::<bool>(), any::<bool>(), 0u64..5), 1..80)
        ) {
            let mut queue = ChangeQueue::new();
            let mut in_flight: Option<ConfigChange> = None;

            for (i, (is_push, is_add, uid)) in ops.into_iter().enumerate() {
                let change = if is_add {
                    ConfigChange::add(i as u64, peer(uid))
                } else {
                    ConfigChange::remove(i as u64, peer(uid))
                };

                let proposed = if is_push {
                    queue.push(change)
                } else {
                    if in_flight.is_some_and(|f| f.same_edit(&change)) {
                        in_flight = None;
                    }
                    queue.applied(&change)
                };

                if let Some(p) = proposed {
                    prop_assert!(in_flight.is_none(), "two changes outstanding");
                    in_flight = Some(p);
                }
                prop_assert_eq!(queue.outstanding(), in_flight);
            }
        }

        #[test]
        fn prop_every_distinct_change_is_proposed_in_order(
            events in prop::collection::vec((any::<bool>(), 0u64..6), 1..40)
        ) {
            let mut queue = ChangeQueue::new();
            let mut proposals = Vec::new();
            let mut expected: Vec<(ChangeKind, u64)> = Vec::new();

            for (i, (is_add, uid)) in events.into_iter().enumerate() {
                let change = if is_add {
                    ConfigChange::add(i as u64, peer(uid))
                } else {
                    ConfigChange::remove(i as u64, peer(uid))
                };
                if !expected.contains(&(change.kind, uid)) {
                    expected.push((change.kind, uid));
                }
                proposals.extend(queue.push(change));
            }

            // commit whatever is outstanding until nothing is left
            while let Some(outstanding) = queue.outstanding() {
                proposals.extend(queue.applied(&outstanding));
            }

            let proposed: Vec<_> = proposals.iter().map(|c| (c.kind, c.peer.uid)).collect();
            prop_assert_eq!(proposed, expected);
        }
    }

    struct Harness {
        configurator: Configurator,
        add_tx: mpsc::Sender<PeerIdentity>,
        remove_tx: mpsc::Sender<PeerIdentity>,
        conf_change_rx: mpsc::Receiver<ConfigChange>,
        conf_entry_tx: mpsc::Sender<ConfigChange>,
    }

    fn start() -> Harness {
        let (add_tx, add_rx) = mpsc::channel(16);
        let (remove_tx, remove_rx) = mpsc::channel(16);
        let (conf_change_tx, conf_change_rx) = mpsc::channel(1);
        let (conf_entry_tx, conf_entry_rx) = mpsc::channel(16);
        let configurator = Configurator::start(
            1,
            ConfiguratorChannels {
                add_rx,
                remove_rx,
                conf_change_tx,
                conf_entry_rx,
            },
        );
        Harness {
            configurator,
            add_tx,
            remove_tx,
            conf_change_rx,
            conf_entry_tx,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<ConfigChange>) -> Option<ConfigChange> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_configurator_proposes_one_at_a_time() {
        let mut h = start();

        h.add_tx.send(peer(5)).await.unwrap();
        h.remove_tx.send(peer(6)).await.unwrap();

        let first = recv(&mut h.conf_change_rx).await.unwrap();
        assert_eq!(first.kind, ChangeKind::AddPeer);
        assert_eq!(first.peer, peer(5));
        assert_eq!(recv(&mut h.conf_change_rx).await, None);

        h.conf_entry_tx.send(first).await.unwrap();
        let second = recv(&mut h.conf_change_rx).await.unwrap();
        assert_eq!(second.kind, ChangeKind::RemovePeer);
        assert_eq!(second.peer, peer(6));

        h.configurator.stop().await;
    }

    #[tokio::test]
    async fn test_no_proposal_after_stop() {
        let mut h = start();
        h.add_tx.send(peer(5)).await.unwrap();
        h.add_tx.send(peer(6)).await.unwrap();
        let first = recv(&mut h.conf_change_rx).await.unwrap();

        h.configurator.stop().await;
        h.configurator.stop().await;

        // its queue end is gone, the applied entry goes nowhere
        assert!(h.conf_entry_tx.send(first).await.is_err());
        assert_eq!(h.conf_change_rx.recv().await, None);
    }
}
