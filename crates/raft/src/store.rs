//! The replicated store: the key-value state machine fed by the log.
//!
//! Writes are encoded as a [`Proposal`], handed to the controller and only
//! answered once the committed entry carrying them has been applied here.
//! Reads are served from the applied state without going through
//! consensus, so they may lag behind writes other nodes just made.
//!
//! # Request correlation
//!
//! Each proposal carries a [`ProposalId`] of this node's id and a local
//! sequence number. When an entry is applied, the waiter registered under
//! its id, if any, receives the response. Entries proposed by other nodes
//! have no local waiter.

use crate::types::{Committed, CommittedEntry, SnapshotData};
use meshkv_common::{Error, LogIndex, NodeId, Result, Revision, Term};
use meshkv_kv::{
    DeleteRangeRequest, DeleteRangeResponse, KvStateMachine, Operation, OperationCodec,
    OperationError, OperationResponse, Proposal, ProposalId, PutRequest, PutResponse,
    RangeRequest, RangeResponse, TxnRequest, TxnResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Queue ends the store uses to talk to the controller.
pub struct StoreChannels {
    /// Encoded proposals for the controller.
    pub proposal_tx: mpsc::Sender<Vec<u8>>,
    /// Committed writes and snapshots from the controller.
    pub entry_rx: mpsc::Receiver<Committed>,
    /// Snapshots offered to the controller for log compaction.
    pub snapshot_tx: mpsc::Sender<SnapshotData>,
    /// Requests for a snapshot now. The controller holds another sender.
    pub snapshot_request_tx: mpsc::Sender<()>,
    pub snapshot_request_rx: mpsc::Receiver<()>,
}

type Waiters = HashMap<ProposalId, oneshot::Sender<OperationResponse>>;

struct Shared {
    node: NodeId,
    state: RwLock<KvStateMachine>,
    waiters: Mutex<Waiters>,
}

impl Shared {
    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on the running store.
pub struct ReplicatedStore {
    shared: Arc<Shared>,
    codec: Arc<dyn OperationCodec>,
    seq: AtomicU64,
    proposal_tx: mpsc::Sender<Vec<u8>>,
    snapshot_request_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedStore {
    /// Spawns the apply loop.
    ///
    /// A snapshot is offered to the controller every `snapshot_interval`
    /// applied entries.
    pub fn start(
        node: NodeId,
        codec: Arc<dyn OperationCodec>,
        snapshot_interval: u64,
        channels: StoreChannels,
    ) -> Self {
        let shared = Arc::new(Shared {
            node,
            state: RwLock::new(KvStateMachine::new()),
            waiters: Mutex::new(HashMap::new()),
        });
        let cancel = CancellationToken::new();

        let applier = Applier {
            shared: shared.clone(),
            codec: codec.clone(),
            snapshot_interval,
            snapshot_tx: channels.snapshot_tx,
            since_snapshot: 0,
            last_term: 0,
        };
        let task = tokio::spawn(applier.run(
            channels.entry_rx,
            channels.snapshot_request_rx,
            cancel.clone(),
        ));

        Self {
            shared,
            codec,
            seq: AtomicU64::new(1),
            proposal_tx: channels.proposal_tx,
            snapshot_request_tx: channels.snapshot_request_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Reads keys from the applied state.
    pub fn range(&self, req: &RangeRequest) -> RangeResponse {
        self.read().range(req)
    }

    pub fn revision(&self) -> Revision {
        self.read().revision()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.read().last_applied()
    }

    /// Puts a key and waits until the write is applied.
    ///
    /// # Errors
    ///
    /// Returns `Error::Stopped` if the store stops before the write is
    /// applied. There is no timeout: a proposal that is never committed,
    /// e.g. because leadership was lost, keeps the call waiting.
    pub async fn put(&self, req: PutRequest) -> Result<PutResponse> {
        match self.propose(Operation::Put(req)).await? {
            OperationResponse::Put(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_range(&self, req: DeleteRangeRequest) -> Result<DeleteRangeResponse> {
        match self.propose(Operation::DeleteRange(req)).await? {
            OperationResponse::DeleteRange(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    /// Runs a transaction; comparisons are evaluated when it is applied.
    pub async fn txn(&self, req: TxnRequest) -> Result<TxnResponse> {
        match self.propose(Operation::Txn(req)).await? {
            OperationResponse::Txn(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    /// Asks the apply loop to offer a snapshot now.
    pub fn request_snapshot(&self) {
        // a request already queued covers this one
        let _ = self.snapshot_request_tx.try_send(());
    }

    /// Stops the apply loop and fails every pending write with
    /// `Error::Stopped`.
    ///
    /// Idempotent. Must be called before the controller is stopped.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(node = %format!("{:x}", self.shared.node), error = %e, "store task failed");
            }
            tracing::info!(node = %format!("{:x}", self.shared.node), "store stopped");
        }
        self.shared.waiters().clear();
    }

    async fn propose(&self, operation: Operation) -> Result<OperationResponse> {
        let id = ProposalId {
            origin: self.shared.node,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let data = self
            .codec
            .encode(&Proposal { id, operation })
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if self.cancel.is_cancelled() {
            return Err(Error::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.shared.waiters().insert(id, tx);
        // removes the waiter however this call ends, including a caller
        // dropping the future on its own timeout
        let _registered = Registered {
            shared: &self.shared,
            id,
        };

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.proposal_tx.send(data) => sent.is_ok(),
        };
        if !sent {
            return Err(Error::Stopped);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Stopped),
            resp = rx => resp.map_err(|_| Error::Stopped),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KvStateMachine> {
        self.shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registered<'a> {
    shared: &'a Shared,
    id: ProposalId,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.shared.waiters().remove(&self.id);
    }
}

fn unexpected(resp: OperationResponse) -> Error {
    Error::Storage(format!("unexpected response {resp:?}"))
}

/// State of the apply loop.
struct Applier {
    shared: Arc<Shared>,
    codec: Arc<dyn OperationCodec>,
    snapshot_interval: u64,
    snapshot_tx: mpsc::Sender<SnapshotData>,
    since_snapshot: u64,
    last_term: Term,
}

impl Applier {
    async fn run(
        mut self,
        mut entry_rx: mpsc::Receiver<Committed>,
        mut snapshot_request_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(committed) = entry_rx.recv() => self.apply(committed),
                Some(()) = snapshot_request_rx.recv() => self.offer_snapshot(),
                else => break,
            }
        }
    }

    fn apply(&mut self, committed: Committed) {
        match committed {
            Committed::Write(entry) => self.apply_write(entry),
            Committed::Snapshot(snapshot) => self.restore(snapshot),
            Committed::ConfChange(_) => {}
        }
    }

    fn apply_write(&mut self, entry: CommittedEntry) {
        let node = self.shared.node;
        self.last_term = entry.term;

        let proposal = match self.codec.decode(&entry.data) {
            Ok(proposal) => Some(proposal),
            Err(e) => {
                tracing::warn!(node = %format!("{node:x}"), index = entry.index, error = %e, "skipping undecodable entry");
                None
            }
        };

        let result = {
            let mut state = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match &proposal {
                Some(proposal) => state.apply(entry.index, &proposal.operation).map(Some),
                None => state.skip(entry.index).map(|()| None),
            }
        };

        match result {
            Ok(Some(resp)) => {
                if let Some(proposal) = proposal {
                    let waiter = self.shared.waiters().remove(&proposal.id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(resp);
                    }
                }
            }
            Ok(None) => {}
            Err(OperationError::AlreadyApplied {
                index,
                last_applied,
            }) => {
                tracing::debug!(node = %format!("{node:x}"), index, last_applied, "entry already applied");
                return;
            }
            Err(e) => {
                tracing::warn!(node = %format!("{node:x}"), index = entry.index, error = %e, "apply failed");
                return;
            }
        }

        self.since_snapshot += 1;
        if self.since_snapshot >= self.snapshot_interval {
            self.offer_snapshot();
        }
    }

    /// Replaces the state with a leader snapshot. The snapshot may be cut
    /// past the last write it holds, and later entries follow its index.
    fn restore(&mut self, snapshot: SnapshotData) {
        let node = self.shared.node;
        let result = {
            let mut state = self
                .shared
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            state.restore(&snapshot.data).and_then(|()| {
                if state.last_applied() < snapshot.index {
                    state.skip(snapshot.index)
                } else {
                    Ok(())
                }
            })
        };
        match result {
            Ok(()) => {
                self.last_term = snapshot.term;
                self.since_snapshot = 0;
                tracing::info!(node = %format!("{node:x}"), index = snapshot.index, "store restored from snapshot");
            }
            Err(e) => {
                tracing::error!(node = %format!("{node:x}"), index = snapshot.index, error = %e, "snapshot restore failed");
            }
        }
    }

    fn offer_snapshot(&mut self) {
        let node = self.shared.node;
        let (index, data) = {
            let state = self
                .shared
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            (state.last_applied(), state.snapshot())
        };
        if index == 0 {
            return;
        }
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(node = %format!("{node:x}"), error = %e, "snapshot serialization failed");
                return;
            }
        };

        self.since_snapshot = 0;
        let snapshot = SnapshotData {
            index,
            term: self.last_term,
            data,
        };
        if self.snapshot_tx.try_send(snapshot).is_err() {
            tracing::debug!(node = %format!("{node:x}"), index, "controller busy, snapshot not offered");
        } else {
            tracing::debug!(node = %format!("{node:x}"), index, "snapshot offered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_kv::{BincodeCodec, Compare, RequestOp};
    use std::time::Duration;

    /// Stands in for the controller: every proposal is committed at the next
    /// index, in arrival order.
    fn echo_log(
        mut proposal_rx: mpsc::Receiver<Vec<u8>>,
        entry_tx: mpsc::Sender<Committed>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut index = 0;
            while let Some(data) = proposal_rx.recv().await {
                index += 1;
                let entry = Committed::Write(CommittedEntry {
                    index,
                    term: 1,
                    data,
                });
                if entry_tx.send(entry).await.is_err() {
                    return;
                }
            }
        })
    }

    struct Harness {
        store: Arc<ReplicatedStore>,
        proposal_rx: Option<mpsc::Receiver<Vec<u8>>>,
        entry_tx: mpsc::Sender<Committed>,
        snapshot_rx: mpsc::Receiver<SnapshotData>,
    }

    fn start(snapshot_interval: u64) -> Harness {
        let (proposal_tx, proposal_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (snapshot_request_tx, snapshot_request_rx) = mpsc::channel(1);
        let store = ReplicatedStore::start(
            1,
            Arc::new(BincodeCodec),
            snapshot_interval,
            StoreChannels {
                proposal_tx,
                entry_rx,
                snapshot_tx,
                snapshot_request_tx,
                snapshot_request_rx,
            },
        );
        Harness {
            store: Arc::new(store),
            proposal_rx: Some(proposal_rx),
            entry_tx,
            snapshot_rx,
        }
    }

    fn with_echo(h: &mut Harness) {
        let proposal_rx = h.proposal_rx.take().unwrap();
        echo_log(proposal_rx, h.entry_tx.clone());
    }

    #[tokio::test]
    async fn test_put_then_range() {
        let mut h = start(100);
        with_echo(&mut h);

        let resp = h.store.put(PutRequest::new("k", "v")).await.unwrap();
        assert_eq!(resp.header.revision, 1);

        let range = h.store.range(&RangeRequest::key("k"));
        assert_eq!(range.kvs.len(), 1);
        assert_eq!(range.kvs[0].value, b"v");
        assert_eq!(h.store.revision(), 1);
        assert_eq!(h.store.last_applied(), 1);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_delete_and_txn() {
        let mut h = start(100);
        with_echo(&mut h);

        h.store.put(PutRequest::new("a", "1")).await.unwrap();
        let txn = h
            .store
            .txn(TxnRequest {
                compare: vec![Compare::absent("lock")],
                success: vec![RequestOp::Put(PutRequest::new("lock", "me"))],
                failure: vec![],
            })
            .await
            .unwrap();
        assert!(txn.succeeded);

        let deleted = h
            .store
            .delete_range(DeleteRangeRequest::key("a").with_prev_kv())
            .await
            .unwrap();
        assert_eq!(deleted.deleted, 1);
        assert_eq!(deleted.prev_kvs[0].value, b"1");
        assert_eq!(deleted.header.revision, 3);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_puts_all_complete() {
        let mut h = start(100);
        with_echo(&mut h);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = h.store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .put(PutRequest::new(format!("k{i}"), "v"))
                    .await
                    .unwrap()
                    .header
                    .revision
            }));
        }
        let mut revisions = Vec::new();
        for task in tasks {
            revisions.push(task.await.unwrap());
        }
        revisions.sort_unstable();

        assert_eq!(revisions, (1..=20).collect::<Vec<_>>());
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_entries_from_other_nodes_are_applied() {
        let h = start(100);
        let data = BincodeCodec
            .encode(&Proposal {
                id: ProposalId { origin: 2, seq: 1 },
                operation: Operation::Put(PutRequest::new("remote", "x")),
            })
            .unwrap();

        h.entry_tx
            .send(Committed::Write(CommittedEntry {
                index: 4,
                term: 2,
                data,
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.store.last_applied() < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.store.range(&RangeRequest::key("remote")).count, 1);
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_skipped() {
        let h = start(100);
        h.entry_tx
            .send(Committed::Write(CommittedEntry {
                index: 1,
                term: 1,
                data: vec![0xff; 3],
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.store.last_applied() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.store.revision(), 0);
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_offered_every_interval() {
        let mut h = start(2);
        with_echo(&mut h);

        h.store.put(PutRequest::new("a", "1")).await.unwrap();
        h.store.put(PutRequest::new("b", "2")).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(1), h.snapshot_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.index, 2);
        assert_eq!(snapshot.term, 1);

        let mut restored = KvStateMachine::new();
        restored.restore(&snapshot.data).unwrap();
        assert_eq!(restored.len(), 2);

        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_requested_snapshot() {
        let mut h = start(1000);
        with_echo(&mut h);
        h.store.put(PutRequest::new("a", "1")).await.unwrap();

        h.store.request_snapshot();
        let snapshot = tokio::time::timeout(Duration::from_secs(1), h.snapshot_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.index, 1);
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_replaces_state() {
        let h = start(100);
        let mut source = KvStateMachine::new();
        source
            .apply(9, &Operation::Put(PutRequest::new("snap", "shot")))
            .unwrap();

        h.entry_tx
            .send(Committed::Snapshot(SnapshotData {
                index: 9,
                term: 3,
                data: source.snapshot().unwrap(),
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.store.last_applied() < 9 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.store.range(&RangeRequest::key("snap")).kvs[0].value, b"shot");
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_cut_past_last_write_moves_applied_index() {
        let h = start(100);
        let mut source = KvStateMachine::new();
        source
            .apply(5, &Operation::Put(PutRequest::new("snap", "shot")))
            .unwrap();

        // membership entries 6 and 7 followed the last write
        h.entry_tx
            .send(Committed::Snapshot(SnapshotData {
                index: 7,
                term: 2,
                data: source.snapshot().unwrap(),
            }))
            .await
            .unwrap();
        let data = BincodeCodec
            .encode(&Proposal {
                id: ProposalId { origin: 2, seq: 1 },
                operation: Operation::Put(PutRequest::new("next", "x")),
            })
            .unwrap();
        h.entry_tx
            .send(Committed::Write(CommittedEntry {
                index: 8,
                term: 2,
                data,
            }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while h.store.last_applied() < 8 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.store.range(&RangeRequest::key("snap")).count, 1);
        assert_eq!(h.store.range(&RangeRequest::key("next")).count, 1);
        assert_eq!(h.store.revision(), 2);
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_abandoned_write_leaves_no_waiter() {
        let h = start(100);

        let result =
            tokio::time::timeout(Duration::from_millis(20), h.store.put(PutRequest::new("k", "v")))
                .await;
        assert!(result.is_err(), "nobody commits, the put must time out");
        assert!(h.store.shared.waiters().is_empty());
        h.store.stop().await;
    }

    #[tokio::test]
    async fn test_pending_write_fails_on_stop() {
        let h = start(100);
        // nobody commits the proposal
        let store = h.store.clone();
        let pending = tokio::spawn(async move { store.put(PutRequest::new("k", "v")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.store.stop().await;
        h.store.stop().await;

        assert_eq!(pending.await.unwrap(), Err(Error::Stopped));
        assert_eq!(
            h.store.put(PutRequest::new("k", "v")).await,
            Err(Error::Stopped)
        );
    }

    #[tokio::test]
    async fn test_stop_releases_controller_delivering_entries() {
        let h = start(100);
        let entry_tx = h.entry_tx.clone();

        // a controller that keeps handing over entries
        let controller = tokio::spawn(async move {
            let mut index = 0;
            loop {
                index += 1;
                let entry = Committed::Write(CommittedEntry {
                    index,
                    term: 1,
                    data: vec![0xff],
                });
                if entry_tx.send(entry).await.is_err() {
                    return index;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        h.store.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), controller).await;
        assert!(result.is_ok(), "store stop must release the delivering side");
    }
}
