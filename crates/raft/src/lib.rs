//! Raft node for the meshkv replicated key-value store.
//!
//! This crate runs a `raft-rs` consensus node whose peers are reached over a
//! gossip overlay instead of direct connections. It is made of independent
//! tasks that only talk through queues:
//!
//! - **Packet Transport**: moves Raft messages over the overlay connection
//!   and reports peers it could not reach
//! - **Membership Tracker**: watches the overlay topology for peers coming
//!   and going
//! - **Configurator**: turns those events into configuration changes, one at
//!   a time
//! - **Controller**: owns the consensus engine, ticks it and hands committed
//!   output to the other components
//! - **Replicated Store**: the key-value state machine on top of the log
//!
//! [`Server`] bootstraps a node, wires these together and stops them in a
//! fixed order.
//!
//! # Example
//!
//! ```rust,no_run
//! use meshkv_overlay::MemoryMesh;
//! use meshkv_raft::{Server, ServerConfig};
//! use meshkv_kv::{PutRequest, RangeRequest};
//! use std::sync::Arc;
//!
//! # async fn example() -> meshkv_common::Result<()> {
//! let mesh = MemoryMesh::new();
//! let config = ServerConfig { min_peer_count: 1, ..Default::default() };
//! let peer = Arc::new(mesh.join(&config.overlay, 1, "node-1").unwrap());
//!
//! let server = Server::start(config, peer.identity(), peer.clone(), peer).await?;
//! server.store().put(PutRequest::new("foo", "bar")).await?;
//! let resp = server.store().range(&RangeRequest::key("foo"));
//! assert_eq!(resp.kvs[0].value, b"bar");
//!
//! server.shutdown();
//! server.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod configurator;
pub mod controller;
pub mod membership;
pub mod node;
pub mod server;
pub mod storage;
pub mod store;
pub mod translator;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use bootstrap::{BootstrapDecision, BootstrapSequencer, BootstrapState};
pub use config::{RaftConfig, ServerConfig};
pub use configurator::{ChangeQueue, Configurator, ConfiguratorChannels};
pub use controller::{Controller, ControllerChannels};
pub use membership::{ClusterSet, MembershipDiff, MembershipEvents, MembershipTracker};
pub use node::{RaftNode, ReadyOutput};
pub use server::{supervise, Server, ShutdownSequence, Stoppable, TerminalSignals};
pub use storage::MemStorage;
pub use store::{ReplicatedStore, StoreChannels};
pub use translator::{PeerTranslator, TopologyTranslator};
pub use transport::{decode_message, encode_message, PacketTransport, TransportError};
pub use types::{
    ChangeKind, Committed, CommittedEntry, ConfigChange, ControllerState, ControllerStatus,
    SnapshotData,
};
