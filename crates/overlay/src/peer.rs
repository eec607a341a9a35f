//! Peer identities and the overlay traits.

use crate::error::OverlayError;
use async_trait::async_trait;
use bytes::Bytes;
use meshkv_common::{PeerName, PeerUid};
use serde::{Deserialize, Serialize};

/// A peer as reported by the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescription {
    /// Overlay address of the peer.
    pub name: PeerName,
    /// Unique id, assigned by the overlay when the peer joined.
    pub uid: PeerUid,
    /// Human readable name, usually the host name.
    pub nickname: String,
    /// `host:port` the peer listens on.
    pub addr: String,
}

impl PeerDescription {
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            uid: self.uid,
            name: self.name,
        }
    }
}

/// The two identifiers of a peer.
///
/// `uid` identifies the peer to the consensus engine, `name` addresses it on
/// the overlay. Both are fixed once the overlay assigned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub uid: PeerUid,
    pub name: PeerName,
}

impl From<&PeerDescription> for PeerIdentity {
    fn from(desc: &PeerDescription) -> Self {
        desc.identity()
    }
}

/// View of the overlay's current peer set.
pub trait Topology: Send + Sync {
    /// Returns every currently visible peer, this node included.
    fn descriptions(&self) -> Vec<PeerDescription>;
}

/// Best-effort virtual point-to-point connection over the overlay.
///
/// Packets may be lost, duplicated or reordered.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Sends a packet to the peer with the given overlay name.
    async fn send_to(&self, payload: Bytes, to: PeerName) -> Result<(), OverlayError>;

    /// Waits for the next packet. Returns [`OverlayError::Closed`] once the
    /// connection is closed.
    async fn recv_from(&self) -> Result<(Bytes, PeerName), OverlayError>;

    /// Closes the connection. Pending and future `recv_from` calls fail.
    fn close(&self);
}
