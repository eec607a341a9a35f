use meshkv_common::PeerName;
use thiserror::Error;

/// Errors reported by an overlay implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// The packet connection was closed.
    #[error("overlay connection closed")]
    Closed,

    /// No peer with this name is reachable on the overlay.
    #[error("peer {0:x} not known to the overlay")]
    UnknownPeer(PeerName),

    /// The shared secret did not match the channel's.
    #[error("authentication failed for channel {channel}")]
    AuthenticationFailed { channel: String },

    /// A peer with this name already joined.
    #[error("peer {0:x} already joined the overlay")]
    AlreadyJoined(PeerName),
}
