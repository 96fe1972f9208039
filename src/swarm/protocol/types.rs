//! Message and proof types exchanged between peers

use bytes::Bytes;

use crate::swarm::{InfoHash, NodeKey};

/// One sibling subtree root inside an inclusion proof.
///
/// `level` is the height of the subtree this hash covers: 0 is a single
/// leaf's sibling, 1 a two-leaf subtree, and so on up the padded tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofNode {
    /// BLAKE3-256 subtree root
    pub hash: [u8; 32],
    /// Tree level of the subtree (0 = leaf)
    pub level: u8,
}

/// Inclusion proof authenticating a contiguous leaf range against the root.
///
/// Nodes are the sibling subtree roots met while recursing the padded tree,
/// emitted in pre-order; leaves inside the range are omitted because the
/// verifier reconstructs them from the segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Proof {
    /// First leaf covered by the segment
    pub leaf_start: u64,
    /// Number of leaves the segment covers
    pub leaf_count: u64,
    /// Sibling subtree roots in pre-order
    pub nodes: Vec<ProofNode>,
}

/// A peer wire message, without the routing info hash.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Opens the exchange on a session; both sides send one.
    Handshake {
        /// Swarm the sender wants to talk about
        info_hash: InfoHash,
        /// Sender's overlay identity
        peer_id: NodeKey,
    },
    /// Full unit availability snapshot, MSB-first.
    Bitfield {
        /// Raw bitfield bytes
        bits: Bytes,
    },
    /// The sender now has (and can prove) one more unit.
    Have {
        /// Newly available unit
        unit_index: u64,
    },
    /// Asks the remote to transfer one unit.
    Request {
        /// Requested unit
        unit_index: u64,
    },
    /// Unit content plus its inclusion proof.
    Transfer {
        /// Transferred unit
        unit_index: u64,
        /// Unit bytes (short for the last unit of a file)
        data: Bytes,
        /// Inclusion proof; receivers drop transfers without one
        proof: Option<Proof>,
    },
    /// Declines a request. Reserved: receivers treat it as a no-op and let
    /// the request timeout reschedule the unit.
    Reject {
        /// Rejected unit
        unit_index: u64,
        /// Human-readable reason
        reason: String,
    },
}

impl PeerMessage {
    /// Returns the wire type tag for this message.
    pub fn kind(&self) -> u8 {
        match self {
            PeerMessage::Handshake { .. } => 0,
            PeerMessage::Bitfield { .. } => 1,
            PeerMessage::Have { .. } => 2,
            PeerMessage::Request { .. } => 3,
            PeerMessage::Transfer { .. } => 4,
            PeerMessage::Reject { .. } => 5,
        }
    }
}

/// A framed message as it travels on the wire: routing info hash + payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Swarm this message belongs to
    pub info_hash: InfoHash,
    /// The message itself
    pub message: PeerMessage,
}
