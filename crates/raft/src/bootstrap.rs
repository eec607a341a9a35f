//! Decides at startup whether to create a cluster or join one.
//!
//! The decision is a heuristic on the number of visible peers, not an
//! agreement protocol. Nodes that poll across the same window while the
//! overlay is still converging can reach different decisions, or put a peer
//! into two different initial memberships. A peer that vanished for a moment
//! can't be told apart from one that left. Both gaps are known and the
//! sequencer does nothing about them.

use meshkv_common::NodeId;
use meshkv_overlay::{PeerDescription, PeerIdentity, Topology};
use std::time::Duration;

/// Outcome of bootstrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapDecision {
    /// Originate a new cluster with these members, sorted by uid.
    Create(Vec<PeerIdentity>),
    /// Join a running cluster and learn its membership from the log.
    Join,
}

impl BootstrapDecision {
    /// The initial voters to hand the consensus engine. Empty means join.
    pub fn initial_peers(&self) -> Vec<NodeId> {
        match self {
            BootstrapDecision::Create(peers) => peers.iter().map(|p| p.uid).collect(),
            BootstrapDecision::Join => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Polling { attempts: u64 },
    Decided(BootstrapDecision),
}

pub struct BootstrapSequencer {
    min_peer_count: usize,
    poll_interval: Duration,
    state: BootstrapState,
}

impl BootstrapSequencer {
    pub fn new(min_peer_count: usize, poll_interval: Duration) -> Self {
        Self {
            min_peer_count,
            poll_interval,
            state: BootstrapState::Polling { attempts: 0 },
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    /// Evaluates one observation of the visible peers.
    ///
    /// Once a decision is reached it is final; later calls return it again
    /// regardless of `visible`.
    pub fn step(&mut self, visible: &[PeerDescription]) -> Option<BootstrapDecision> {
        let attempts = match &self.state {
            BootstrapState::Decided(decision) => return Some(decision.clone()),
            BootstrapState::Polling { attempts } => attempts + 1,
        };

        let count = visible.len();
        let decision = match count.cmp(&self.min_peer_count) {
            std::cmp::Ordering::Less => {
                tracing::debug!(visible = count, min = self.min_peer_count, attempts, "waiting for peers");
                self.state = BootstrapState::Polling { attempts };
                return None;
            }
            std::cmp::Ordering::Equal => {
                let mut peers: Vec<PeerIdentity> = visible.iter().map(PeerIdentity::from).collect();
                peers.sort_unstable();
                BootstrapDecision::Create(peers)
            }
            std::cmp::Ordering::Greater => BootstrapDecision::Join,
        };

        tracing::info!(visible = count, min = self.min_peer_count, attempts, decision = ?decision, "bootstrap decided");
        self.state = BootstrapState::Decided(decision.clone());
        Some(decision)
    }

    /// Polls `topology` until a decision is reached.
    pub async fn run(&mut self, topology: &dyn Topology) -> BootstrapDecision {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Some(decision) = self.step(&topology.descriptions()) {
                return decision;
            }
        }
    }
}
