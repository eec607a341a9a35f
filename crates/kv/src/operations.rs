//! Operation types for state machine commands
//!
//! This module defines the mutations carried in the Raft log. A client write
//! becomes a [`Proposal`]: the [`Operation`] plus an id that lets the node
//! which proposed it recognise the entry once it is applied. Proposals are
//! turned into log payloads by an [`OperationCodec`]; the default codec is
//! bincode.

use crate::types::{
    DeleteRangeRequest, DeleteRangeResponse, PutRequest, PutResponse, TxnRequest, TxnResponse,
};
use meshkv_common::{LogIndex, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during operation processing
#[derive(Error, Debug)]
pub enum OperationError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    /// The log index was already applied, or arrived out of order
    #[error("Entry already applied or out of order: index {index} <= last_applied {last_applied}")]
    AlreadyApplied {
        index: LogIndex,
        last_applied: LogIndex,
    },
}

/// Result type for operation methods
pub type OperationResult<T> = Result<T, OperationError>;

/// Operations that can be applied to the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Set a key-value pair
    Put(PutRequest),
    /// Delete a key or a range of keys
    DeleteRange(DeleteRangeRequest),
    /// Conditional multi-operation transaction
    Txn(TxnRequest),
}

/// What applying an [`Operation`] produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResponse {
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
    Txn(TxnResponse),
}

/// Identifies a proposal across the cluster.
///
/// `origin` is the node that proposed it, `seq` is a per-node counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId {
    pub origin: NodeId,
    pub seq: u64,
}

/// A write proposal as it travels through the Raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub operation: Operation,
}

/// Converts proposals to and from Raft log payloads.
///
/// The replicated store only ever sees opaque bytes from the log; the codec
/// decides how an operation is laid out in them.
pub trait OperationCodec: Send + Sync {
    fn encode(&self, proposal: &Proposal) -> OperationResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> OperationResult<Proposal>;
}

/// Bincode proposal codec.
///
/// # Examples
///
/// ```
/// use meshkv_kv::{BincodeCodec, Operation, OperationCodec, Proposal, ProposalId, PutRequest};
///
/// let proposal = Proposal {
///     id: ProposalId { origin: 1, seq: 7 },
///     operation: Operation::Put(PutRequest::new("foo", "bar")),
/// };
/// let bytes = BincodeCodec.encode(&proposal).unwrap();
/// assert_eq!(BincodeCodec.decode(&bytes).unwrap(), proposal);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl OperationCodec for BincodeCodec {
    fn encode(&self, proposal: &Proposal) -> OperationResult<Vec<u8>> {
        bincode::serialize(proposal).map_err(OperationError::SerializationError)
    }

    fn decode(&self, bytes: &[u8]) -> OperationResult<Proposal> {
        bincode::deserialize(bytes).map_err(OperationError::SerializationError)
    }
}
