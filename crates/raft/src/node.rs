//! Raft engine driver that wraps raft-rs `RawNode`.
//!
//! `RaftNode` owns the `RawNode` and its [`MemStorage`] and turns each raft-rs
//! `Ready` into a [`ReadyOutput`]: the messages to send and the committed
//! output in commit order. It does no I/O; the controller moves the output
//! onto the component queues.

use crate::config::RaftConfig;
use crate::storage::MemStorage;
use crate::types::{ChangeKind, Committed, CommittedEntry, ConfigChange, SnapshotData};
use meshkv_common::{Error, LogIndex, NodeId, Result, Term};
use prost::Message as _;
use raft::eraftpb::{ConfChange, ConfState, Entry, EntryType, Message};
use raft::{RawNode, SnapshotStatus, StateRole, Storage, StorageError};

/// What one round of ready handling produced.
#[derive(Debug, Default)]
pub struct ReadyOutput {
    /// Messages for other peers, addressed by `msg.to`.
    pub messages: Vec<Message>,

    /// Committed writes, membership changes and snapshots, in commit order.
    pub committed: Vec<Committed>,

    /// Set when a committed change removed this node from the cluster.
    pub removed: bool,

    /// Set when a follower needed a snapshot the log could not supply. The
    /// store should offer a fresh one.
    pub snapshot_wanted: bool,
}

impl ReadyOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.committed.is_empty() && !self.removed && !self.snapshot_wanted
    }
}

/// A configuration change waiting for its commit.
#[derive(Debug, Clone, Copy)]
struct PendingChange {
    change: ConfigChange,
    ticks: usize,
}

/// Raft node that drives consensus using raft-rs.
pub struct RaftNode {
    id: NodeId,
    raw_node: RawNode<MemStorage>,

    /// Proposed configuration change not yet seen committed.
    pending: Option<PendingChange>,
    retry_ticks: usize,

    /// Conf state after each applied membership change, oldest first.
    ///
    /// A snapshot must carry the membership as of its own index, which can
    /// be older than the current one.
    conf_history: Vec<(LogIndex, ConfState)>,

    applied: LogIndex,
    /// Index of the last write handed out, or of the installed snapshot.
    last_write: LogIndex,
    removed: bool,
}

impl RaftNode {
    /// Creates a new RaftNode with the given node ID and initial peers.
    ///
    /// A non-empty `peers` list creates a new cluster with exactly those
    /// voters. An empty list joins an existing one: the node starts without
    /// voters and learns the membership from the log the leader sends it.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if raft-rs rejects the configuration and
    /// `Error::Raft` if the engine cannot be created.
    ///
    /// # Examples
    ///
    /// ```
    /// use meshkv_raft::{RaftConfig, RaftNode};
    ///
    /// let node = RaftNode::new(1, &[1, 2, 3], &RaftConfig::default()).unwrap();
    /// assert!(!node.is_leader());
    /// assert_eq!(node.leader_id(), None);
    /// ```
    pub fn new(id: NodeId, peers: &[NodeId], config: &RaftConfig) -> Result<Self> {
        let mut voters = peers.to_vec();
        voters.sort_unstable();
        voters.dedup();

        let storage = MemStorage::bootstrap(&voters);
        let conf_history = vec![(0, storage.conf_state())];

        let raft_config = raft::Config {
            id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            applied: 0,
            max_size_per_msg: config.max_size_per_msg,
            max_inflight_msgs: config.max_inflight_msgs,
            ..Default::default()
        };
        raft_config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let raw_node = RawNode::new(
            &raft_config,
            storage,
            &slog::Logger::root(slog::Discard, slog::o!()),
        )
        .map_err(|e| Error::Raft(e.to_string()))?;

        Ok(Self {
            id,
            raw_node,
            pending: None,
            retry_ticks: config.conf_change_retry_ticks,
            conf_history,
            applied: 0,
            last_write: 0,
            removed: false,
        })
    }

    /// Advances the logical clock by one tick.
    ///
    /// Also re-proposes the pending configuration change once it has waited
    /// `conf_change_retry_ticks` ticks. raft-rs silently drops a change
    /// proposed while another is in flight or while no leader is known, so
    /// without the retry a membership edit could be lost.
    pub fn tick(&mut self) {
        self.raw_node.tick();

        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.ticks += 1;
        if pending.ticks < self.retry_ticks {
            return;
        }
        pending.ticks = 0;
        let change = pending.change;

        tracing::debug!(node = %format!("{:x}", self.id), peer = %format!("{:x}", change.peer.uid), "re-proposing configuration change");
        if let Err(e) = self.raw_node.propose_conf_change(vec![], change.to_raft()) {
            tracing::debug!(node = %format!("{:x}", self.id), error = %e, "configuration change not accepted");
        }
    }

    /// Feeds a message from another peer into the engine.
    ///
    /// # Errors
    ///
    /// Returns `Error::Raft` if raft-rs rejects the message, typically one
    /// from a peer that is not part of the configuration.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw_node
            .step(msg)
            .map_err(|e| Error::Raft(e.to_string()))
    }

    /// Tells the engine `uid` could not be reached. A snapshot in flight to
    /// it counts as failed, so the leader will try again.
    pub fn report_unreachable(&mut self, uid: NodeId) {
        self.raw_node.report_unreachable(uid);
        self.raw_node.report_snapshot(uid, SnapshotStatus::Failure);
    }

    /// Reports the outcome of sending a snapshot to `uid`.
    ///
    /// Until a report arrives the leader holds back log entries for that
    /// follower, on a lossy overlay possibly forever.
    pub fn report_snapshot(&mut self, uid: NodeId, status: SnapshotStatus) {
        self.raw_node.report_snapshot(uid, status);
    }

    /// Proposes an encoded write.
    ///
    /// Followers forward the proposal to the leader.
    ///
    /// # Errors
    ///
    /// Returns `Error::Raft` if the proposal was dropped, e.g. because no
    /// leader is known. The caller decides whether to retry.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<()> {
        self.raw_node
            .propose(vec![], data)
            .map_err(|e| Error::Raft(e.to_string()))
    }

    /// Proposes a membership change and keeps it pending until it commits.
    ///
    /// The change stays pending even if this first attempt fails, and is
    /// retried from [`tick`](Self::tick).
    ///
    /// # Errors
    ///
    /// Returns `Error::Raft` if raft-rs refused this attempt.
    pub fn propose_conf_change(&mut self, change: ConfigChange) -> Result<()> {
        self.pending = Some(PendingChange { change, ticks: 0 });
        self.raw_node
            .propose_conf_change(vec![], change.to_raft())
            .map_err(|e| Error::Raft(e.to_string()))
    }

    /// Processes the pending Ready state of the engine.
    ///
    /// Follows the raft-rs ordering: messages are collected first, an
    /// incoming snapshot is installed, committed entries are applied, new
    /// entries and the hard state are persisted, and only then is the node
    /// advanced. Entries committed by the advance are applied as well, so
    /// the returned output is complete for this round.
    ///
    /// # Errors
    ///
    /// Returns an error if storage rejects a snapshot or entries.
    pub fn handle_ready(&mut self) -> Result<ReadyOutput> {
        let mut out = ReadyOutput {
            snapshot_wanted: self.raw_node.store().take_snapshot_request(),
            ..Default::default()
        };
        if !self.raw_node.has_ready() {
            return Ok(out);
        }

        let mut ready = self.raw_node.ready();
        out.messages.extend(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let meta = snapshot.get_metadata().clone();
            self.raw_node
                .store()
                .apply_snapshot(snapshot.clone())
                .map_err(storage_error)?;

            self.applied = meta.index;
            self.last_write = meta.index;
            self.conf_history = vec![(meta.index, meta.get_conf_state().clone())];
            out.committed.push(Committed::Snapshot(SnapshotData {
                index: meta.index,
                term: meta.term,
                data: snapshot.data.to_vec(),
            }));
            tracing::info!(node = %format!("{:x}", self.id), index = meta.index, "installed snapshot");
        }

        self.apply_committed(ready.take_committed_entries(), &mut out);

        if !ready.entries().is_empty() {
            self.raw_node
                .store()
                .append(ready.entries())
                .map_err(storage_error)?;
        }
        if let Some(hs) = ready.hs() {
            self.raw_node.store().set_hard_state(hs.clone());
        }
        out.messages.extend(ready.take_persisted_messages());

        let mut light = self.raw_node.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.raw_node.store().set_commit(commit);
        }
        out.messages.extend(light.take_messages());
        self.apply_committed(light.take_committed_entries(), &mut out);
        self.raw_node.advance_apply();

        out.removed = self.removed;
        Ok(out)
    }

    /// Installs a store snapshot taken at `snapshot.index` and truncates the
    /// log up to it.
    ///
    /// If no write was handed out after `snapshot.index`, the store state is
    /// also the state at the applied index, and the snapshot is cut there with
    /// the current membership. Otherwise it carries the membership as of its
    /// own index. A snapshot that is not newer than the current one is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the index was never applied on this node.
    pub fn compact(&mut self, snapshot: SnapshotData) -> Result<()> {
        if snapshot.index > self.applied {
            return Err(Error::Storage(format!(
                "snapshot index {} is ahead of applied index {}",
                snapshot.index, self.applied
            )));
        }

        let (index, conf_state) = if snapshot.index >= self.last_write {
            (self.applied, self.raw_node.store().conf_state())
        } else {
            (snapshot.index, self.conf_state_at(snapshot.index))
        };
        let store = self.raw_node.store();
        match store.create_snapshot(index, conf_state, snapshot.data) {
            Ok(()) => {}
            Err(raft::Error::Store(StorageError::SnapshotOutOfDate)) => return Ok(()),
            Err(e) => return Err(storage_error(e)),
        }
        store.compact(index).map_err(storage_error)?;

        // keep the newest state at or below the snapshot index
        let keep_from = self
            .conf_history
            .iter()
            .rposition(|(at, _)| *at <= index)
            .unwrap_or(0);
        self.conf_history.drain(..keep_from);

        tracing::debug!(node = %format!("{:x}", self.id), index, store_index = snapshot.index, "compacted log");
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Checks if this node is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.raw_node.raft.state == StateRole::Leader
    }

    pub fn role(&self) -> StateRole {
        self.raw_node.raft.state
    }

    /// Returns the current leader's id, or `None` while no leader is known.
    pub fn leader_id(&self) -> Option<NodeId> {
        match self.raw_node.raft.leader_id {
            raft::INVALID_ID => None,
            leader => Some(leader),
        }
    }

    pub fn term(&self) -> Term {
        self.raw_node.raft.term
    }

    /// Index of the last entry handed out as committed.
    pub fn applied(&self) -> LogIndex {
        self.applied
    }

    /// Index of the latest snapshot in storage, 0 if there is none.
    pub fn snapshot_index(&self) -> LogIndex {
        self.raw_node.store().snapshot_index()
    }

    #[cfg(test)]
    pub(crate) fn storage(&self) -> &MemStorage {
        self.raw_node.store()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn pending_conf_change(&self) -> Option<ConfigChange> {
        self.pending.map(|p| p.change)
    }

    /// Index of the first entry still in the log.
    pub fn first_index(&self) -> LogIndex {
        self.raw_node.store().first_index().unwrap_or(1)
    }

    pub fn voters(&self) -> Vec<NodeId> {
        let mut voters = self.raw_node.store().conf_state().voters;
        voters.sort_unstable();
        voters
    }

    fn apply_committed(&mut self, entries: Vec<Entry>, out: &mut ReadyOutput) {
        for entry in entries {
            self.applied = entry.index;

            // leaders commit an empty entry on election
            if entry.data.is_empty() {
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryNormal => {
                    self.last_write = entry.index;
                    out.committed.push(Committed::Write(CommittedEntry {
                        index: entry.index,
                        term: entry.term,
                        data: entry.data.to_vec(),
                    }));
                }
                EntryType::EntryConfChange => {
                    if let Some(change) = self.apply_conf_change(&entry) {
                        out.committed.push(Committed::ConfChange(change));
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    tracing::warn!(node = %format!("{:x}", self.id), index = entry.index, "ignoring joint configuration change");
                }
            }
        }
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Option<ConfigChange> {
        let cc = match ConfChange::decode(&entry.data[..]) {
            Ok(cc) => cc,
            Err(e) => {
                tracing::warn!(node = %format!("{:x}", self.id), index = entry.index, error = %e, "malformed configuration change");
                return None;
            }
        };

        match self.raw_node.apply_conf_change(&cc) {
            Ok(conf_state) => {
                self.raw_node.store().set_conf_state(conf_state.clone());
                self.conf_history.push((entry.index, conf_state));
            }
            Err(e) => {
                tracing::warn!(node = %format!("{:x}", self.id), index = entry.index, error = %e, "configuration change rejected");
                return None;
            }
        }

        let change = ConfigChange::from_raft(&cc)?;
        if self
            .pending
            .is_some_and(|pending| pending.change.same_edit(&change))
        {
            self.pending = None;
        }
        if change.kind == ChangeKind::RemovePeer && change.peer.uid == self.id {
            tracing::warn!(node = %format!("{:x}", self.id), index = entry.index, "removed from cluster");
            self.removed = true;
        } else {
            tracing::info!(node = %format!("{:x}", self.id), peer = %format!("{:x}", change.peer.uid), kind = ?change.kind, index = entry.index, "applied configuration change");
        }
        Some(change)
    }

    fn conf_state_at(&self, index: LogIndex) -> ConfState {
        self.conf_history
            .iter()
            .rev()
            .find(|(at, _)| *at <= index)
            .map(|(_, cs)| cs.clone())
            .unwrap_or_else(|| self.raw_node.store().conf_state())
    }
}

fn storage_error(e: raft::Error) -> Error {
    Error::Storage(e.to_string())
}
