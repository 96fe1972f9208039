//! Swarm engine: descriptors, verifiable storage, peers, and scheduling
//!
//! A swarm binds one descriptor to its on-disk store, its proof cache, the
//! peer handlers currently attached to it, and the transfer scheduler that
//! drives downloads.

pub mod bitfield;
pub mod descriptor;
pub mod merkle;
pub mod peer;
pub mod proof_cache;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod tracker;

use std::fmt;

pub use bitfield::Bitfield;
pub use descriptor::Descriptor;
pub use peer::{ConnectionState, PeerHandler};
pub use proof_cache::ProofCache;
pub use protocol::{Envelope, PeerMessage, Proof, ProofNode};
pub use scheduler::{Scheduler, UnitState};
pub use state::Swarm;
pub use store::UnitStore;

/// Transfer unit size in bytes. The last unit of a file may be shorter.
pub const UNIT_SIZE: u64 = 64 * 1024;

/// BLAKE3-256 hash of a swarm descriptor's canonical form.
///
/// Routes peer traffic and identifies a swarm across the network. Always
/// recomputed from descriptor content, never trusted from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 32]);

impl InfoHash {
    /// Creates an InfoHash from a 32-byte BLAKE3 hash.
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns a reference to the underlying 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Overlay-network identity of a peer node.
///
/// Opaque to the engine; the session layer maps it to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Creates a NodeKey from its string form.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors surfaced by the swarm engine.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Inclusion proof failed verification: level mismatch, missing or
    /// excess nodes, empty proof, or root mismatch.
    #[error("bad proof: {reason}")]
    BadProof {
        /// What the verifier tripped on
        reason: String,
    },

    /// A byte range fell outside the file described by the descriptor.
    #[error("range out of bounds: offset {offset}, length {length}")]
    OutOfBounds {
        /// Requested start offset
        offset: u64,
        /// Requested length
        length: u64,
    },

    /// A positioned write completed only partially.
    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite {
        /// Bytes that should have been written
        expected: usize,
        /// Bytes actually written
        written: usize,
    },

    /// A wire frame exceeded the allowed length.
    #[error("oversize frame: {length} bytes")]
    Oversize {
        /// Declared frame length
        length: u32,
    },

    /// A wire message or payload failed to decode.
    #[error("malformed message: {message}")]
    Malformed {
        /// Decoder diagnostic
        message: String,
    },

    /// A dial or handshake did not complete in time.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out
        operation: &'static str,
    },

    /// A descriptor failed structural validation or deserialization.
    #[error("invalid descriptor: {reason}")]
    DescriptorInvalid {
        /// What failed validation
        reason: String,
    },

    /// No swarm is registered for the given info hash.
    #[error("swarm {info_hash} not found")]
    SwarmNotFound {
        /// The unknown info hash
        info_hash: InfoHash,
    },

    /// The peer is gone or was never attached to the swarm.
    #[error("peer {peer} unavailable")]
    PeerUnavailable {
        /// The peer in question
        peer: NodeKey,
    },

    /// Underlying filesystem or connection I/O failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        hash[1] = 0x23;
        hash[31] = 0xef;
        let info_hash = InfoHash::new(hash);
        let hex = info_hash.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("0123"));
        assert!(hex.ends_with("ef"));
    }

    #[test]
    fn test_node_key_round_trip() {
        let key = NodeKey::new("ab12cd34");
        assert_eq!(key.as_str(), "ab12cd34");
        assert_eq!(key.to_string(), "ab12cd34");
        assert_eq!(key, NodeKey::from("ab12cd34"));
    }
}
