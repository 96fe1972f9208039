//! Tracker announce types and the transport seam
//!
//! The engine only needs a send-and-await-reply function keyed by a tracker
//! address string; the actual RPC transport (whatever overlay carries it)
//! is injected behind [`TrackerTransport`].

use async_trait::async_trait;

use super::{InfoHash, NodeKey, SwarmError};

/// Lifecycle event reported with an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    /// Periodic reannounce, no lifecycle change
    #[default]
    None,
    /// The swarm just started on this node
    Started,
    /// The swarm is being stopped
    Stopped,
    /// The download finished
    Completed,
}

impl AnnounceEvent {
    /// Returns the wire form of the event; periodic announces are empty.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Announce request sent to every tracker of a swarm.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Swarm being announced
    pub info_hash: InfoHash,
    /// Lifecycle event
    pub event: AnnounceEvent,
    /// Total bytes served to peers
    pub uploaded: u64,
    /// Total bytes received from peers
    pub downloaded: u64,
    /// Bytes still missing from the file
    pub left: u64,
    /// Seconds since the Unix epoch at send time
    pub timestamp: u64,
}

/// One peer returned by a tracker.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Overlay identity to dial
    pub node_key: NodeKey,
    /// Whether the tracker believes this peer has the whole file
    pub is_seeder: bool,
}

/// Tracker reply: suggested reannounce interval plus known peers.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Suggested seconds until the next announce
    pub interval: i32,
    /// Peers currently in the swarm
    pub peers: Vec<PeerInfo>,
}

/// Request/response channel to trackers, injected by the embedding node.
#[async_trait]
pub trait TrackerTransport: Send + Sync {
    /// Sends one announce to the tracker at `tracker` and awaits the reply.
    ///
    /// # Errors
    ///
    /// Transport-defined; the engine logs failures and moves to the next
    /// tracker.
    async fn announce(
        &self,
        tracker: &str,
        request: AnnounceRequest,
    ) -> Result<AnnounceResponse, SwarmError>;

    /// Releases transport resources.
    async fn close(&self);
}
