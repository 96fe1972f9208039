//! Baobun - verifiable peer-to-peer file distribution
//!
//! A content-addressed swarm engine: each swarm is anchored by a compact
//! descriptor identifying a single file by its BLAKE3 Merkle root. Peers
//! exchange fixed-size transfer units together with inclusion proofs, so
//! data integrity never depends on peer honesty.

#![warn(missing_docs)]
#![warn(clippy::too_many_lines)]

pub mod client;
pub mod config;
pub mod session;
pub mod swarm;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use client::Client;
pub use config::BaobunConfig;
pub use session::{Connection, Overlay, SessionManager};
pub use swarm::descriptor::Descriptor;
pub use swarm::{InfoHash, NodeKey, Swarm, SwarmError};
pub use tracing_setup::init_tracing;

/// Convenience Result type using SwarmError as the error type
pub type Result<T> = std::result::Result<T, SwarmError>;
