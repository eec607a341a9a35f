//! Error types for the meshkv replicated store.
//!
//! `Error` is the node-level error: what a component reports to the node
//! assembly and what the node assembly reports to its caller. The two
//! terminal cluster conditions live here because they end the node.

use thiserror::Error;

/// Common error type for meshkv operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The committed cluster configuration no longer contains this node.
    #[error("the Raft peer was removed from the cluster")]
    RemovedFromCluster,

    /// The overlay reports fewer peers than the configured minimum.
    #[error("the Raft cluster got too small: {size} peers, minimum {min}")]
    ClusterShrunk {
        /// Number of peers currently visible.
        size: usize,
        /// Configured minimum peer count.
        min: usize,
    },

    /// Raft consensus error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The component has been stopped and can no longer serve the request.
    #[error("component stopped")]
    Stopped,
}

impl Error {
    /// Returns true for the conditions that terminate the node.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::RemovedFromCluster | Error::ClusterShrunk { .. })
    }
}

/// Convenience type alias for Result with meshkv Error.
pub type Result<T> = std::result::Result<T, Error>;
