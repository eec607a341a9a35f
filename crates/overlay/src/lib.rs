//! Overlay network boundary for meshkv.
//!
//! The replicated store never talks TCP to its peers. Everything it needs from
//! the gossip overlay is captured by two traits:
//!
//! - [`Topology`]: enumerate the peers currently visible on the overlay
//! - [`PacketConn`]: a best-effort virtual point-to-point packet connection
//!
//! [`memory::MemoryMesh`] is an in-process overlay implementing both, with
//! fault injection, used for tests and local clusters.

pub mod config;
pub mod error;
pub mod memory;
pub mod peer;

pub use config::OverlayConfig;
pub use error::OverlayError;
pub use memory::{FaultPlan, MemoryMesh, MemoryPeer};
pub use peer::{PacketConn, PeerDescription, PeerIdentity, Topology};
