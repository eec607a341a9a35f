//! Membership tracking against the overlay topology.
//!
//! The overlay's view of who is around is not the cluster membership; that
//! is decided by committed configuration changes. The tracker only turns
//! differences in the view into add and remove events for the configurator,
//! and gives up once too few peers are left.

use meshkv_common::{NodeId, PeerUid};
use meshkv_overlay::{PeerIdentity, Topology};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Peers currently visible on the overlay, keyed by uid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSet {
    members: BTreeMap<PeerUid, PeerIdentity>,
}

impl ClusterSet {
    pub fn observe(topology: &dyn Topology) -> Self {
        topology.descriptions().iter().map(PeerIdentity::from).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, uid: PeerUid) -> bool {
        self.members.contains_key(&uid)
    }

    /// Members sorted by uid.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.members.values().copied().collect()
    }

    pub fn uids(&self) -> Vec<PeerUid> {
        self.members.keys().copied().collect()
    }

    /// What changed going from `self` to `next`, both sides sorted by uid.
    pub fn diff(&self, next: &ClusterSet) -> MembershipDiff {
        MembershipDiff {
            added: next
                .members
                .values()
                .filter(|p| !self.members.contains_key(&p.uid))
                .copied()
                .collect(),
            removed: self
                .members
                .values()
                .filter(|p| !next.members.contains_key(&p.uid))
                .copied()
                .collect(),
        }
    }
}

impl FromIterator<PeerIdentity> for ClusterSet {
    fn from_iter<I: IntoIterator<Item = PeerIdentity>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().map(|p| (p.uid, p)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: Vec<PeerIdentity>,
    pub removed: Vec<PeerIdentity>,
}

impl MembershipDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Where the tracker sends what it finds.
pub struct MembershipEvents {
    pub add_tx: mpsc::Sender<PeerIdentity>,
    pub remove_tx: mpsc::Sender<PeerIdentity>,
    /// Receives the set size once it dropped below the minimum.
    pub shrunk_tx: oneshot::Sender<usize>,
}

/// Handle on the running tracker task.
pub struct MembershipTracker {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipTracker {
    /// Spawns the tracker, polling `topology` every `poll_interval`.
    ///
    /// `initial` is the set the node bootstrapped with; only differences
    /// from it are reported.
    pub fn start(
        node: NodeId,
        topology: Arc<dyn Topology>,
        initial: ClusterSet,
        min_peer_count: usize,
        poll_interval: Duration,
        events: MembershipEvents,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            node,
            topology,
            initial,
            min_peer_count,
            poll_interval,
            events,
            cancel.clone(),
        ));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops polling. Idempotent; no event is sent after it returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "membership tracker task failed");
            }
        }
    }
}

async fn run(
    node: NodeId,
    topology: Arc<dyn Topology>,
    mut current: ClusterSet,
    min_peer_count: usize,
    poll_interval: Duration,
    events: MembershipEvents,
    cancel: CancellationToken,
) {
    let MembershipEvents {
        add_tx,
        remove_tx,
        shrunk_tx,
    } = events;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let next = ClusterSet::observe(topology.as_ref());
        let diff = current.diff(&next);
        current = next;

        for peer in diff.added {
            tracing::info!(node = %format!("{node:x}"), peer = %format!("{:x}", peer.uid), "peer appeared");
            if !send(&add_tx, peer, &cancel).await {
                return;
            }
        }
        for peer in diff.removed {
            tracing::info!(node = %format!("{node:x}"), peer = %format!("{:x}", peer.uid), "peer disappeared");
            if !send(&remove_tx, peer, &cancel).await {
                return;
            }
        }

        if current.len() < min_peer_count {
            tracing::warn!(
                node = %format!("{node:x}"),
                size = current.len(),
                min = min_peer_count,
                "cluster shrunk below minimum"
            );
            let _ = shrunk_tx.send(current.len());
            return;
        }
    }
}

/// Returns false if cancelled before the event was queued.
async fn send(
    tx: &mpsc::Sender<PeerIdentity>,
    peer: PeerIdentity,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(peer) => {
            if sent.is_err() {
                tracing::debug!(peer = %format!("{:x}", peer.uid), "membership event dropped, configurator gone");
            }
            true
        }
    }
}
