//! Resolves Raft node ids to overlay names.

use crate::transport::TransportError;
use meshkv_common::{PeerName, PeerUid};
use meshkv_overlay::Topology;
use std::sync::Arc;

/// Maps the uid a Raft message is addressed to onto the overlay name the
/// packet connection sends to.
pub trait PeerTranslator: Send + Sync {
    fn translate(&self, uid: PeerUid) -> Result<PeerName, TransportError>;
}

impl<F> PeerTranslator for F
where
    F: Fn(PeerUid) -> Result<PeerName, TransportError> + Send + Sync,
{
    fn translate(&self, uid: PeerUid) -> Result<PeerName, TransportError> {
        self(uid)
    }
}

/// Looks the uid up in the overlay's current peer descriptions.
///
/// Holds no state of its own, so a peer that left the overlay stops
/// resolving immediately.
pub struct TopologyTranslator {
    topology: Arc<dyn Topology>,
}

impl TopologyTranslator {
    pub fn new(topology: Arc<dyn Topology>) -> Self {
        Self { topology }
    }
}

impl PeerTranslator for TopologyTranslator {
    fn translate(&self, uid: PeerUid) -> Result<PeerName, TransportError> {
        self.topology
            .descriptions()
            .into_iter()
            .find(|desc| desc.uid == uid)
            .map(|desc| desc.name)
            .ok_or(TransportError::UnknownPeer(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshkv_overlay::{MemoryMesh, OverlayConfig};

    #[test]
    fn test_topology_translator_resolves_visible_peers() {
        let mesh = MemoryMesh::new();
        let a = Arc::new(mesh.join(&OverlayConfig::default(), 10, "a").unwrap());
        let b = mesh.join(&OverlayConfig::default(), 20, "b").unwrap();

        let translator = TopologyTranslator::new(a);
        assert_eq!(translator.translate(b.identity().uid).unwrap(), 20);

        mesh.leave(20);
        assert!(matches!(
            translator.translate(b.identity().uid),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_closure_translator() {
        let translator = |uid: PeerUid| -> Result<PeerName, TransportError> {
            if uid == 1 {
                Ok(100)
            } else {
                Err(TransportError::UnknownPeer(uid))
            }
        };

        assert_eq!(translator.translate(1).unwrap(), 100);
        assert!(translator.translate(2).is_err());
    }
}
