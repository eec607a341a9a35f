//! In-memory storage implementation for Raft consensus.
//!
//! This module provides `MemStorage`, the log and hard-state store the
//! consensus engine reads through the [`raft::Storage`] trait. Nothing is
//! persisted; a restarted node rejoins the cluster and catches up from the
//! leader.
//!
//! # Thread Safety
//!
//! All fields are wrapped in `RwLock`. Locks are always taken in field order
//! (hard state, conf state, entries, snapshot).

use prost::Message as _;
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory storage for Raft state.
///
/// `MemStorage` stores all Raft consensus state in memory:
/// - `hard_state`: Persistent voting state (term, vote, commit)
/// - `conf_state`: Cluster membership configuration
/// - `entries`: Log entries after the last snapshot
/// - `snapshot`: Latest snapshot, the compaction point of the log
///
/// # Examples
///
/// ```
/// use meshkv_raft::MemStorage;
/// use raft::Storage;
///
/// let storage = MemStorage::bootstrap(&[1, 2, 3]);
/// assert_eq!(storage.last_index().unwrap(), 3);
/// assert_eq!(storage.initial_state().unwrap().conf_state.voters, vec![1, 2, 3]);
/// ```
#[derive(Debug)]
pub struct MemStorage {
    /// Persistent state that must survive crashes.
    hard_state: RwLock<HardState>,

    /// Current cluster membership configuration.
    conf_state: RwLock<ConfState>,

    /// Log entries for state machine replication.
    ///
    /// The vector does not start at index 1 after log compaction.
    entries: RwLock<Vec<Entry>>,

    /// Current snapshot for log compaction.
    snapshot: RwLock<Snapshot>,

    /// Set when the engine asked for a snapshot this storage could not serve.
    snapshot_wanted: AtomicBool,

    #[cfg(test)]
    fail_appends: AtomicBool,
}

impl MemStorage {
    /// Creates an empty `MemStorage`.
    ///
    /// A node started on empty storage has no voters and learns the
    /// membership from the log its leader replicates to it.
    pub fn new() -> Self {
        Self {
            hard_state: RwLock::new(HardState::default()),
            conf_state: RwLock::new(ConfState::default()),
            entries: RwLock::new(Vec::new()),
            snapshot: RwLock::new(Snapshot::default()),
            snapshot_wanted: AtomicBool::new(false),
            #[cfg(test)]
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Creates storage for a brand-new cluster with the given voters.
    ///
    /// Besides setting the voters, one committed `AddNode` entry per peer is
    /// written at term 1. Every creator writes the same entries, and a node
    /// joining later replays them to learn the initial membership.
    pub fn bootstrap(peers: &[u64]) -> Self {
        let storage = Self::new();
        if peers.is_empty() {
            return storage;
        }

        let entries: Vec<Entry> = peers
            .iter()
            .enumerate()
            .map(|(i, &peer)| {
                let mut cc = ConfChange::default();
                cc.set_change_type(ConfChangeType::AddNode);
                cc.node_id = peer;

                let mut entry = Entry::default();
                entry.set_entry_type(EntryType::EntryConfChange);
                entry.term = 1;
                entry.index = i as u64 + 1;
                entry.data = cc.encode_to_vec().into();
                entry
            })
            .collect();

        {
            let mut hs = write(&storage.hard_state);
            hs.term = 1;
            hs.commit = entries.len() as u64;
        }
        write(&storage.conf_state).voters = peers.to_vec();
        *write(&storage.entries) = entries;

        storage
    }

    pub fn set_hard_state(&self, hard_state: HardState) {
        *write(&self.hard_state) = hard_state;
    }

    pub fn set_commit(&self, commit: u64) {
        write(&self.hard_state).commit = commit;
    }

    pub fn set_conf_state(&self, conf_state: ConfState) {
        *write(&self.conf_state) = conf_state;
    }

    pub fn hard_state(&self) -> HardState {
        read(&self.hard_state).clone()
    }

    pub fn conf_state(&self) -> ConfState {
        read(&self.conf_state).clone()
    }

    /// Index of the latest snapshot, 0 if there is none.
    pub fn snapshot_index(&self) -> u64 {
        read(&self.snapshot).get_metadata().index
    }

    /// Returns whether a snapshot was refused since the last call, and clears
    /// the flag.
    pub fn take_snapshot_request(&self) -> bool {
        self.snapshot_wanted.swap(false, Ordering::AcqRel)
    }

    /// Makes every later append fail.
    #[cfg(test)]
    pub(crate) fn fail_appends(&self) {
        self.fail_appends.store(true, Ordering::Release);
    }

    /// Appends entries, replacing any conflicting suffix of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the entries start before the first index (they
    /// would overwrite compacted entries) or leave a gap after the last.
    pub fn append(&self, ents: &[Entry]) -> raft::Result<()> {
        let Some(first_new) = ents.first() else {
            return Ok(());
        };
        #[cfg(test)]
        if self.fail_appends.load(Ordering::Acquire) {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let mut entries = write(&self.entries);
        let snapshot = read(&self.snapshot);
        let first = first_index_of(&entries, &snapshot);
        let last = last_index_of(&entries, &snapshot);

        if first_new.index < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if first_new.index > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        entries.truncate((first_new.index - first) as usize);
        entries.extend_from_slice(ents);
        Ok(())
    }

    /// Replaces the log with a snapshot received from the leader.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotOutOfDate` if the snapshot is older than the log.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> raft::Result<()> {
        let meta = snapshot.get_metadata().clone();

        let mut hard_state = write(&self.hard_state);
        let mut conf_state = write(&self.conf_state);
        let mut entries = write(&self.entries);
        let mut current = write(&self.snapshot);

        if first_index_of(&entries, &current) > meta.index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }

        hard_state.term = hard_state.term.max(meta.term);
        hard_state.commit = meta.index;
        *conf_state = meta.get_conf_state().clone();
        entries.clear();
        *current = snapshot;
        Ok(())
    }

    /// Records a snapshot of the state machine taken at `index`.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotOutOfDate` if a newer snapshot exists, or an error if
    /// `index` is not in the log.
    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> raft::Result<()> {
        if index <= read(&self.snapshot).get_metadata().index {
            return Err(raft::Error::Store(StorageError::SnapshotOutOfDate));
        }
        let term = self.term(index)?;

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(conf_state);

        *write(&self.snapshot) = snapshot;
        Ok(())
    }

    /// Discards all entries before `compact_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if `compact_index` is beyond the end of the log.
    pub fn compact(&self, compact_index: u64) -> raft::Result<()> {
        let mut entries = write(&self.entries);
        let snapshot = read(&self.snapshot);
        let first = first_index_of(&entries, &snapshot);
        let last = last_index_of(&entries, &snapshot);

        if compact_index <= first {
            return Ok(());
        }
        if compact_index > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        entries.drain(..(compact_index - first) as usize);
        Ok(())
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(RaftState::new(
            read(&self.hard_state).clone(),
            read(&self.conf_state).clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let entries = read(&self.entries);
        let snapshot = read(&self.snapshot);
        let first = first_index_of(&entries, &snapshot);
        let last = last_index_of(&entries, &snapshot);

        if low < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        if low >= high {
            return Ok(Vec::new());
        }

        let lo = (low - first) as usize;
        let hi = (high - first) as usize;
        let mut ents = entries[lo..hi].to_vec();
        raft::util::limit_size(&mut ents, max_size.into());
        Ok(ents)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let entries = read(&self.entries);
        let snapshot = read(&self.snapshot);
        let meta = snapshot.get_metadata();

        if idx == meta.index {
            return Ok(meta.term);
        }

        let first = first_index_of(&entries, &snapshot);
        if idx < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        entries
            .get((idx - first) as usize)
            .map(|e| e.term)
            .ok_or(raft::Error::Store(StorageError::Unavailable))
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(first_index_of(&read(&self.entries), &read(&self.snapshot)))
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(last_index_of(&read(&self.entries), &read(&self.snapshot)))
    }

    /// Serves the latest snapshot to `to`.
    ///
    /// A snapshot older than `request_index`, or one whose membership does not
    /// include `to`, would be rejected by the recipient. Both are refused as
    /// temporarily unavailable and flag that a fresh snapshot is wanted; the
    /// leader asks again on a later heartbeat.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let snapshot = read(&self.snapshot);
        let meta = snapshot.get_metadata();
        let conf_state = meta.get_conf_state();
        let member = conf_state.voters.contains(&to) || conf_state.learners.contains(&to);
        if meta.index < request_index || !member {
            self.snapshot_wanted.store(true, Ordering::Release);
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot.clone())
    }
}

fn first_index_of(entries: &[Entry], snapshot: &Snapshot) -> u64 {
    match entries.first() {
        Some(e) => e.index,
        None => snapshot.get_metadata().index + 1,
    }
}

fn last_index_of(entries: &[Entry], snapshot: &Snapshot) -> u64 {
    match entries.last() {
        Some(e) => e.index,
        None => snapshot.get_metadata().index,
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
