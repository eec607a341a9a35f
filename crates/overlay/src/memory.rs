//! In-process overlay network.
//!
//! `MemoryMesh` plays the part of the gossip overlay inside one process: every
//! joined peer sees every other peer on its channel, and packets are moved
//! between per-peer inboxes. A [`FaultPlan`] drops or duplicates packets so
//! that loss tolerance can be exercised deterministically.

use crate::config::OverlayConfig;
use crate::error::OverlayError;
use crate::peer::{PacketConn, PeerDescription, PeerIdentity, Topology};
use async_trait::async_trait;
use bytes::Bytes;
use meshkv_common::{PeerName, PeerUid};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Packet = (Bytes, PeerName);

/// Deterministic packet faults applied to every send on the mesh.
///
/// Counters are mesh-wide: with `drop_every: 3` every third packet sent by
/// any peer is silently lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Drop every n-th packet. 0 disables dropping.
    pub drop_every: u64,
    /// Deliver every n-th packet twice. 0 disables duplication.
    pub duplicate_every: u64,
}

struct Member {
    description: PeerDescription,
    channel: String,
    password: Option<String>,
    inbox: mpsc::UnboundedSender<Packet>,
}

#[derive(Default)]
struct MeshState {
    joined: u64,
    members: BTreeMap<PeerName, Member>,
    faults: FaultPlan,
    sent: u64,
}

/// Shared in-process overlay. Cloning yields another handle to the same mesh.
///
/// # Examples
///
/// ```
/// use meshkv_overlay::{MemoryMesh, OverlayConfig, Topology};
///
/// let mesh = MemoryMesh::new();
/// let config = OverlayConfig::default();
/// let a = mesh.join(&config, 1, "a").unwrap();
/// let _b = mesh.join(&config, 2, "b").unwrap();
/// assert_eq!(a.descriptions().len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct MemoryMesh {
    state: Arc<Mutex<MeshState>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the mesh under `name`, returning the peer's connection.
    ///
    /// The mesh assigns the unique id. Joining a channel whose members use a
    /// different shared secret fails.
    pub fn join(
        &self,
        config: &OverlayConfig,
        name: PeerName,
        nickname: impl Into<String>,
    ) -> Result<MemoryPeer, OverlayError> {
        let mut state = self.lock();

        if state.members.contains_key(&name) {
            return Err(OverlayError::AlreadyJoined(name));
        }
        let mismatch = state
            .members
            .values()
            .any(|m| m.channel == config.channel && m.password != config.password);
        if mismatch {
            return Err(OverlayError::AuthenticationFailed {
                channel: config.channel.clone(),
            });
        }

        state.joined += 1;
        let uid = assign_uid(state.joined);
        let description = PeerDescription {
            name,
            uid,
            nickname: nickname.into(),
            addr: config.addr(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        state.members.insert(
            name,
            Member {
                description: description.clone(),
                channel: config.channel.clone(),
                password: config.password.clone(),
                inbox: tx,
            },
        );
        tracing::debug!(peer = %format!("{name:x}"), uid = %format!("{uid:x}"), "peer joined mesh");

        Ok(MemoryPeer {
            mesh: self.clone(),
            description,
            channel: config.channel.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        })
    }

    /// Removes a peer from the mesh. Its inbox closes and nobody sees it
    /// any more. Returns false if no such peer was joined.
    pub fn leave(&self, name: PeerName) -> bool {
        let removed = self.lock().members.remove(&name).is_some();
        if removed {
            tracing::debug!(peer = %format!("{name:x}"), "peer left mesh");
        }
        removed
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        let mut state = self.lock();
        state.faults = faults;
        state.sent = 0;
    }

    /// Number of peers currently joined, across all channels.
    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().members.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spreads join order over the id space so uids never coincide with names.
fn assign_uid(joined: u64) -> PeerUid {
    joined.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1
}

/// One peer's handle on a [`MemoryMesh`].
pub struct MemoryPeer {
    mesh: MemoryMesh,
    description: PeerDescription,
    channel: String,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: CancellationToken,
}

impl MemoryPeer {
    pub fn identity(&self) -> PeerIdentity {
        self.description.identity()
    }

    pub fn description(&self) -> &PeerDescription {
        &self.description
    }
}

impl Topology for MemoryPeer {
    fn descriptions(&self) -> Vec<PeerDescription> {
        let state = self.mesh.lock();
        if !state.members.contains_key(&self.description.name) {
            return Vec::new();
        }
        state
            .members
            .values()
            .filter(|m| m.channel == self.channel)
            .map(|m| m.description.clone())
            .collect()
    }
}

#[async_trait]
impl PacketConn for MemoryPeer {
    async fn send_to(&self, payload: Bytes, to: PeerName) -> Result<(), OverlayError> {
        if self.closed.is_cancelled() {
            return Err(OverlayError::Closed);
        }

        let mut state = self.mesh.lock();
        let inbox = match state.members.get(&to) {
            Some(member) if member.channel == self.channel => member.inbox.clone(),
            _ => return Err(OverlayError::UnknownPeer(to)),
        };

        state.sent += 1;
        let FaultPlan {
            drop_every,
            duplicate_every,
        } = state.faults;
        if drop_every > 0 && state.sent % drop_every == 0 {
            return Ok(());
        }
        let copies = if duplicate_every > 0 && state.sent % duplicate_every == 0 {
            2
        } else {
            1
        };
        drop(state);

        for _ in 0..copies {
            // a receiver that went away is indistinguishable from loss
            let _ = inbox.send((payload.clone(), self.description.name));
        }
        Ok(())
    }

    async fn recv_from(&self) -> Result<Packet, OverlayError> {
        let mut inbox = tokio::select! {
            _ = self.closed.cancelled() => return Err(OverlayError::Closed),
            inbox = self.inbox.lock() => inbox,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(OverlayError::Closed),
            packet = inbox.recv() => packet.ok_or(OverlayError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
