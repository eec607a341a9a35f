//! State machine for the replicated key-value store.
//!
//! The state machine maintains the keyed map, the store revision and the last
//! applied log index. Committed operations are applied strictly in log order;
//! reads are answered from whatever has been applied so far.

use crate::operations::{Operation, OperationError, OperationResponse, OperationResult};
use crate::types::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse, KeyValue,
    PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseHeader, ResponseOp,
    TxnRequest, TxnResponse,
};
use meshkv_common::{LogIndex, Revision};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

/// State machine that maintains versioned key-value state.
///
/// # Examples
///
/// ```
/// use meshkv_kv::KvStateMachine;
///
/// let sm = KvStateMachine::new();
/// assert_eq!(sm.last_applied(), 0);
/// assert_eq!(sm.revision(), 0);
/// assert_eq!(sm.get(b"key"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStateMachine {
    /// The key-value data store, ordered for range reads
    data: BTreeMap<Vec<u8>, KeyValue>,
    /// Revision of the last state-changing operation
    revision: Revision,
    /// The last applied log index
    last_applied: LogIndex,
}

impl KvStateMachine {
    /// Creates a new empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves the key-value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&KeyValue> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the current store revision.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Returns the last applied log index.
    ///
    /// A value of 0 indicates no entries have been applied yet.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Answers a range request from the applied state.
    pub fn range(&self, req: &RangeRequest) -> RangeResponse {
        let matching = self.select(&req.key, &req.range_end);
        let count = matching.len();

        let mut kvs: Vec<KeyValue> = if req.count_only {
            Vec::new()
        } else {
            matching.into_iter().cloned().collect()
        };

        let more = req.limit > 0 && count > req.limit;
        if req.limit > 0 {
            kvs.truncate(req.limit);
        }
        if req.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }

        RangeResponse {
            header: self.header(),
            kvs,
            more,
            count,
        }
    }

    /// Apply a committed log entry to the state machine.
    ///
    /// Rejects an index at or below `last_applied`; the log delivers each
    /// entry once and in order, so such an index means a delivery bug.
    ///
    /// # Examples
    ///
    /// ```
    /// use meshkv_kv::{KvStateMachine, Operation, OperationResponse, PutRequest};
    ///
    /// let mut sm = KvStateMachine::new();
    /// let resp = sm.apply(1, &Operation::Put(PutRequest::new("foo", "bar"))).unwrap();
    /// assert!(matches!(resp, OperationResponse::Put(p) if p.header.revision == 1));
    /// assert_eq!(sm.last_applied(), 1);
    /// ```
    pub fn apply(
        &mut self,
        index: LogIndex,
        operation: &Operation,
    ) -> OperationResult<OperationResponse> {
        self.check_index(index)?;

        let next = self.revision + 1;
        let mut changed = false;
        let response = match operation {
            Operation::Put(req) => OperationResponse::Put(self.put(req, next, &mut changed)),
            Operation::DeleteRange(req) => {
                OperationResponse::DeleteRange(self.delete_range(req, &mut changed))
            }
            Operation::Txn(req) => OperationResponse::Txn(self.txn(req, next, &mut changed)),
        };

        if changed {
            self.revision = next;
        }
        self.last_applied = index;

        Ok(with_revision(response, self.revision))
    }

    /// Advances `last_applied` past an entry that carries no operation.
    pub fn skip(&mut self, index: LogIndex) -> OperationResult<()> {
        self.check_index(index)?;
        self.last_applied = index;
        Ok(())
    }

    /// Serializes the full state, including revision and last applied index.
    pub fn snapshot(&self) -> OperationResult<Vec<u8>> {
        bincode::serialize(self).map_err(OperationError::SerializationError)
    }

    /// Replaces the state with a snapshot produced by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, snapshot: &[u8]) -> OperationResult<()> {
        let restored: KvStateMachine = bincode::deserialize(snapshot)?;
        *self = restored;
        Ok(())
    }

    fn check_index(&self, index: LogIndex) -> OperationResult<()> {
        if index <= self.last_applied {
            return Err(OperationError::AlreadyApplied {
                index,
                last_applied: self.last_applied,
            });
        }
        Ok(())
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.revision,
        }
    }

    fn select(&self, key: &[u8], range_end: &[u8]) -> Vec<&KeyValue> {
        if range_end.is_empty() {
            return self.data.get(key).into_iter().collect();
        }
        if range_end == [0] {
            return self
                .data
                .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .map(|(_, kv)| kv)
                .collect();
        }
        if key >= range_end {
            return Vec::new();
        }
        self.data
            .range::<[u8], _>((Bound::Included(key), Bound::Excluded(range_end)))
            .map(|(_, kv)| kv)
            .collect()
    }

    fn put(&mut self, req: &PutRequest, revision: Revision, changed: &mut bool) -> PutResponse {
        let prev = self.data.get(&req.key).cloned();
        let kv = match &prev {
            Some(existing) => KeyValue {
                key: req.key.clone(),
                value: req.value.clone(),
                create_revision: existing.create_revision,
                mod_revision: revision,
                version: existing.version + 1,
            },
            None => KeyValue {
                key: req.key.clone(),
                value: req.value.clone(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
            },
        };
        self.data.insert(req.key.clone(), kv);
        *changed = true;

        PutResponse {
            header: self.header(),
            prev_kv: if req.prev_kv { prev } else { None },
        }
    }

    fn delete_range(
        &mut self,
        req: &DeleteRangeRequest,
        changed: &mut bool,
    ) -> DeleteRangeResponse {
        let keys: Vec<Vec<u8>> = self
            .select(&req.key, &req.range_end)
            .into_iter()
            .map(|kv| kv.key.clone())
            .collect();

        let mut prev_kvs = Vec::new();
        for key in &keys {
            if let Some(kv) = self.data.remove(key) {
                if req.prev_kv {
                    prev_kvs.push(kv);
                }
            }
        }
        if !keys.is_empty() {
            *changed = true;
        }

        DeleteRangeResponse {
            header: self.header(),
            deleted: keys.len(),
            prev_kvs,
        }
    }

    fn txn(&mut self, req: &TxnRequest, revision: Revision, changed: &mut bool) -> TxnResponse {
        let succeeded = req.compare.iter().all(|cmp| self.compare(cmp));
        let ops = if succeeded { &req.success } else { &req.failure };

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let resp = match op {
                RequestOp::Range(r) => ResponseOp::Range(self.range(r)),
                RequestOp::Put(r) => ResponseOp::Put(self.put(r, revision, changed)),
                RequestOp::DeleteRange(r) => {
                    ResponseOp::DeleteRange(self.delete_range(r, changed))
                }
            };
            responses.push(resp);
        }

        TxnResponse {
            header: self.header(),
            succeeded,
            responses,
        }
    }

    fn compare(&self, cmp: &Compare) -> bool {
        let kv = self.data.get(&cmp.key);
        let ordering = match (&cmp.target, kv) {
            (CompareTarget::Version(v), _) => kv.map_or(0, |kv| kv.version).cmp(v),
            (CompareTarget::CreateRevision(r), _) => {
                kv.map_or(0, |kv| kv.create_revision).cmp(r)
            }
            (CompareTarget::ModRevision(r), _) => kv.map_or(0, |kv| kv.mod_revision).cmp(r),
            (CompareTarget::Value(v), Some(kv)) => kv.value.as_slice().cmp(v.as_slice()),
            // a missing key has no value to compare against
            (CompareTarget::Value(_), None) => return false,
        };

        match cmp.result {
            CompareResult::Equal => ordering == Ordering::Equal,
            CompareResult::NotEqual => ordering != Ordering::Equal,
            CompareResult::Greater => ordering == Ordering::Greater,
            CompareResult::Less => ordering == Ordering::Less,
        }
    }
}

/// Stamps the final store revision on every header of a response.
///
/// Inner responses are built while the operation is still running, before
/// the revision is bumped.
fn with_revision(response: OperationResponse, revision: Revision) -> OperationResponse {
    let header = ResponseHeader { revision };
    match response {
        OperationResponse::Put(mut r) => {
            r.header = header;
            OperationResponse::Put(r)
        }
        OperationResponse::DeleteRange(mut r) => {
            r.header = header;
            OperationResponse::DeleteRange(r)
        }
        OperationResponse::Txn(mut r) => {
            r.header = header;
            for inner in &mut r.responses {
                match inner {
                    ResponseOp::Range(x) => x.header = header,
                    ResponseOp::Put(x) => x.header = header,
                    ResponseOp::DeleteRange(x) => x.header = header,
                }
            }
            OperationResponse::Txn(r)
        }
    }
}
