//! Values exchanged between the node's components.
//!
//! The consensus log is opaque bytes to raft-rs. At the boundary where the
//! controller hands committed entries out, they become a tagged
//! [`Committed`] value: a write for the store, a membership change for the
//! configurator, or a snapshot that replaces the store state.

use meshkv_common::{LogIndex, NodeId, PeerName, Term};
use meshkv_overlay::PeerIdentity;
use raft::eraftpb::{ConfChange, ConfChangeType};
use raft::StateRole;
use serde::{Deserialize, Serialize};

/// A committed write entry, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

/// Serialized store state and the log position it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub index: LogIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

/// One item of committed output, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    Write(CommittedEntry),
    ConfChange(ConfigChange),
    Snapshot(SnapshotData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    AddPeer,
    RemovePeer,
}

/// A cluster membership edit.
///
/// `id` correlates a proposal with its commit and travels in the raft-rs
/// `ConfChange::id` field. The peer's overlay name travels in the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigChange {
    pub id: u64,
    pub kind: ChangeKind,
    pub peer: PeerIdentity,
}

impl ConfigChange {
    pub fn add(id: u64, peer: PeerIdentity) -> Self {
        Self {
            id,
            kind: ChangeKind::AddPeer,
            peer,
        }
    }

    pub fn remove(id: u64, peer: PeerIdentity) -> Self {
        Self {
            id,
            kind: ChangeKind::RemovePeer,
            peer,
        }
    }

    /// Whether `other` changes the same peer in the same direction.
    pub fn same_edit(&self, other: &ConfigChange) -> bool {
        self.kind == other.kind && self.peer.uid == other.peer.uid
    }

    pub fn to_raft(&self) -> ConfChange {
        let mut cc = ConfChange::default();
        cc.id = self.id;
        cc.node_id = self.peer.uid;
        cc.set_change_type(match self.kind {
            ChangeKind::AddPeer => ConfChangeType::AddNode,
            ChangeKind::RemovePeer => ConfChangeType::RemoveNode,
        });
        cc.context = self.peer.name.to_be_bytes().to_vec().into();
        cc
    }

    /// Converts a committed raft-rs change back.
    ///
    /// Returns `None` for learner changes, which this node never proposes.
    /// Entries written at bootstrap carry no context; their name is 0.
    pub fn from_raft(cc: &ConfChange) -> Option<Self> {
        let kind = match cc.get_change_type() {
            ConfChangeType::AddNode => ChangeKind::AddPeer,
            ConfChangeType::RemoveNode => ChangeKind::RemovePeer,
            ConfChangeType::AddLearnerNode => return None,
        };
        let name = <[u8; 8]>::try_from(&cc.context[..])
            .map(PeerName::from_be_bytes)
            .unwrap_or(0);
        Some(Self {
            id: cc.id,
            kind,
            peer: PeerIdentity {
                uid: cc.node_id,
                name,
            },
        })
    }
}

/// Lifecycle of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Snapshot of the controller published after every loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub role: StateRole,
    /// `None` while no leader is known.
    pub leader_id: Option<NodeId>,
    pub term: Term,
    pub applied: LogIndex,
}

impl ControllerStatus {
    pub fn starting() -> Self {
        Self {
            state: ControllerState::Starting,
            role: StateRole::Follower,
            leader_id: None,
            term: 0,
            applied: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == StateRole::Leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerIdentity {
        PeerIdentity {
            uid: 0xabc1,
            name: 0x0102_0304_0506_0708,
        }
    }

    #[test]
    fn test_config_change_to_raft() {
        let cc = ConfigChange::add(7, peer()).to_raft();

        assert_eq!(cc.id, 7);
        assert_eq!(cc.node_id, 0xabc1);
        assert_eq!(cc.get_change_type(), ConfChangeType::AddNode);
        assert_eq!(&cc.context[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_config_change_from_raft() {
        let change = ConfigChange::remove(3, peer());
        assert_eq!(ConfigChange::from_raft(&change.to_raft()), Some(change));
    }

    #[test]
    fn test_from_raft_without_context() {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = 5;

        let change = ConfigChange::from_raft(&cc).unwrap();
        assert_eq!(change.peer.uid, 5);
        assert_eq!(change.peer.name, 0);
    }

    #[test]
    fn test_from_raft_ignores_learners() {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddLearnerNode);
        assert_eq!(ConfigChange::from_raft(&cc), None);
    }

    #[test]
    fn test_same_edit_ignores_id_and_name() {
        let a = ConfigChange::add(1, peer());
        let mut b = ConfigChange::add(2, peer());
        b.peer.name = 99;

        assert!(a.same_edit(&b));
        assert!(!a.same_edit(&ConfigChange::remove(1, peer())));
    }

    #[test]
    fn test_status_starting() {
        let status = ControllerStatus::starting();
        assert_eq!(status.state, ControllerState::Starting);
        assert!(!status.is_leader());
        assert_eq!(status.leader_id, None);
    }
}
