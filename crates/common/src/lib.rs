//! Common types and errors shared across the meshkv crates.
//!
//! This crate provides the node-level error type and the identifier aliases
//! used by the overlay, consensus and key-value layers.

pub mod errors;
pub mod types;

// Re-export commonly used types for convenience
pub use errors::{Error, Result};
pub use types::{LogIndex, NodeId, PeerName, PeerUid, Revision, Term};
