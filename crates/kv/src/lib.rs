//! Key-value state machine for the meshkv replicated store
//!
//! This crate is the deterministic half of the replicated store: it knows how
//! a committed write is applied to the keyed map, how reads are answered, and
//! how the whole state is snapshotted. It knows nothing about consensus.
//!
//! # Architecture
//!
//! - **Types**: versioned key-value requests and responses (range, put,
//!   delete-range, txn)
//! - **Operations**: the mutations carried in the Raft log and the pluggable
//!   codec used to turn them into log payloads
//! - **State machine**: the keyed map, the revision counter and the last
//!   applied log index
//!
//! # Example
//!
//! ```rust
//! use meshkv_kv::{KvStateMachine, Operation, PutRequest, RangeRequest};
//!
//! let mut sm = KvStateMachine::new();
//! sm.apply(1, &Operation::Put(PutRequest::new("foo", "bar"))).unwrap();
//!
//! let resp = sm.range(&RangeRequest::key("foo"));
//! assert_eq!(resp.kvs[0].value, b"bar");
//! assert_eq!(resp.header.revision, 1);
//! ```

pub mod operations;
pub mod state_machine;
pub mod types;

// Re-export commonly used types for convenience
pub use operations::{
    BincodeCodec, Operation, OperationCodec, OperationError, OperationResponse, OperationResult,
    Proposal, ProposalId,
};
pub use state_machine::KvStateMachine;
pub use types::{
    prefix_end, Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse,
    KeyValue, PutRequest, PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseHeader,
    ResponseOp, TxnRequest, TxnResponse,
};
