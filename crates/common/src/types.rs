//! Common type aliases used throughout meshkv.
//!
//! The overlay hands every peer two identifiers: a unique id that is stable
//! for the lifetime of the peer process, and a peer name that addresses it on
//! the overlay. The unique id doubles as the Raft node id.

/// Overlay-assigned unique identifier of a peer.
///
/// Used as the Raft node id, so it must be greater than 0.
///
/// # Examples
///
/// ```
/// use meshkv_common::PeerUid;
///
/// let uid: PeerUid = 0x2a;
/// assert!(uid > 0);
/// ```
pub type PeerUid = u64;

/// Overlay address of a peer.
///
/// This is what the virtual packet connection sends to. It is resolved from a
/// [`PeerUid`] by the peer translator.
pub type PeerName = u64;

/// Identifier of a node in the Raft cluster. Always a [`PeerUid`].
pub type NodeId = PeerUid;

/// Raft term number.
pub type Term = u64;

/// Index into the Raft log.
///
/// Log indices start at 1 and increase monotonically. Index 0 means "nothing
/// applied yet".
pub type LogIndex = u64;

/// Key-value store revision.
///
/// Signed to match the versioned key-value API, where revisions are 64-bit
/// signed integers. Starts at 0 for an empty store.
///
/// # Examples
///
/// ```
/// use meshkv_common::Revision;
///
/// let current: Revision = 4;
/// assert!(current + 1 > current);
/// ```
pub type Revision = i64;
