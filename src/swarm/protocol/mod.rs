//! Peer wire protocol: message types and binary framing codec

pub mod messages;
pub mod types;

pub use messages::MessageCodec;
pub use types::{Envelope, PeerMessage, Proof, ProofNode};

/// Frames larger than this are rejected and tear the session down.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;
