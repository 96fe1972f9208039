//! Node-level client: swarm ownership, tracker announces, pause control
//!
//! The client owns the swarms running on this node and talks to trackers;
//! peer traffic itself flows through the [`SessionManager`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BaobunConfig;
use crate::session::SessionManager;
use crate::swarm::descriptor::Descriptor;
use crate::swarm::tracker::{AnnounceEvent, AnnounceRequest, TrackerTransport};
use crate::swarm::{ConnectionState, InfoHash, NodeKey, Swarm, SwarmError};

/// A running node: owns swarms and tracker communication.
pub struct Client {
    node_key: NodeKey,
    transport: Arc<dyn TrackerTransport>,
    sessions: Arc<SessionManager>,
    swarms: RwLock<HashMap<InfoHash, Arc<Swarm>>>,
    config: BaobunConfig,
    shutdown: watch::Sender<bool>,
    self_ref: Weak<Client>,
}

impl Client {
    /// Creates a client on top of an existing session manager and tracker
    /// transport.
    pub fn new(
        transport: Arc<dyn TrackerTransport>,
        sessions: Arc<SessionManager>,
        config: BaobunConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            node_key: sessions.local_key(),
            transport,
            sessions,
            swarms: RwLock::new(HashMap::new()),
            config,
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    /// The client always lives in an `Arc`; this recovers it for task
    /// spawning.
    fn strong_self(&self) -> Arc<Client> {
        self.self_ref.upgrade().expect("client still alive")
    }

    /// Returns this node's overlay identity.
    pub fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    /// Imports a `.bao` descriptor file, creating and registering a swarm
    /// whose data lives under `location`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::DescriptorInvalid` - descriptor fails to load
    /// - `SwarmError::Io` - store cannot be opened
    pub fn import_descriptor(
        &self,
        path: &Path,
        location: impl Into<PathBuf>,
    ) -> Result<InfoHash, SwarmError> {
        let descriptor = Descriptor::load(path)?;
        self.import(descriptor, location)
    }

    /// Imports a descriptor from raw `.bao` JSON bytes.
    ///
    /// # Errors
    ///
    /// Same as [`Self::import_descriptor`].
    pub fn import_descriptor_bytes(
        &self,
        data: &[u8],
        location: impl Into<PathBuf>,
    ) -> Result<InfoHash, SwarmError> {
        let descriptor = Descriptor::from_bytes(data)?;
        self.import(descriptor, location)
    }

    /// Binds an already-loaded descriptor into a running swarm.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - store cannot be opened
    pub fn import(
        &self,
        descriptor: Descriptor,
        location: impl Into<PathBuf>,
    ) -> Result<InfoHash, SwarmError> {
        let swarm = Swarm::open(descriptor, location, self.config.clone())?;
        let info_hash = swarm.info_hash();

        self.swarms
            .write()
            .expect("swarm map lock poisoned")
            .insert(info_hash, Arc::clone(&swarm));
        self.sessions.register_swarm(swarm);

        info!("imported swarm {info_hash}");
        Ok(info_hash)
    }

    /// Looks up a swarm by info hash.
    pub fn swarm(&self, info_hash: InfoHash) -> Option<Arc<Swarm>> {
        self.swarms
            .read()
            .expect("swarm map lock poisoned")
            .get(&info_hash)
            .cloned()
    }

    fn swarms_snapshot(&self) -> Vec<Arc<Swarm>> {
        self.swarms
            .read()
            .expect("swarm map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Returns whether the swarm is paused.
    pub fn is_paused(&self, info_hash: InfoHash) -> bool {
        self.swarm(info_hash).is_some_and(|swarm| swarm.is_paused())
    }

    /// Pauses a swarm: the scheduler stops issuing requests, connect
    /// attempts are refused, and all current peers are disconnected.
    pub async fn pause_swarm(&self, info_hash: InfoHash) -> bool {
        let Some(swarm) = self.swarm(info_hash) else {
            return false;
        };
        swarm.set_paused(true);
        swarm.disconnect_all(&self.sessions).await;
        true
    }

    /// Resumes a paused swarm.
    pub fn unpause_swarm(&self, info_hash: InfoHash) {
        if let Some(swarm) = self.swarm(info_hash) {
            swarm.set_paused(false);
        }
    }

    /// Detaches a swarm from the node, disconnecting its peers and closing
    /// its store. The swarm's data stays on disk.
    pub async fn remove_swarm(&self, info_hash: InfoHash) -> Option<Arc<Swarm>> {
        let swarm = self
            .swarms
            .write()
            .expect("swarm map lock poisoned")
            .remove(&info_hash)?;

        self.sessions.deregister_swarm(info_hash);
        swarm.disconnect_all(&self.sessions).await;
        swarm.close();
        Some(swarm)
    }

    /// Dials and handshakes one peer for a swarm, logging the outcome.
    /// Refused while the swarm is paused.
    pub async fn connect_peer(&self, swarm: &Arc<Swarm>, peer: NodeKey) {
        if swarm.is_paused() {
            return;
        }

        match self
            .sessions
            .connect_peer(swarm, peer.clone(), self.config.network.handshake_timeout)
            .await
        {
            Ok(_) => info!("connected to peer {peer} for swarm {}", swarm.info_hash()),
            Err(e) => warn!("connect peer failed ({peer}): {e}"),
        }
    }

    /// Announces a swarm to all its trackers and dials every new peer the
    /// trackers return.
    pub async fn announce_swarm(&self, info_hash: InfoHash, event: AnnounceEvent) {
        let Some(swarm) = self.swarm(info_hash) else {
            warn!("swarm not found: {info_hash}");
            return;
        };
        if swarm.is_paused() {
            return;
        }
        self.announce_one(&swarm, event).await;
    }

    async fn announce_one(&self, swarm: &Arc<Swarm>, event: AnnounceEvent) {
        let request = AnnounceRequest {
            info_hash: swarm.info_hash(),
            event,
            uploaded: swarm.uploaded(),
            downloaded: swarm.downloaded(),
            left: swarm.calc_left(),
            timestamp: unix_timestamp(),
        };

        for tracker in &swarm.descriptor().trackers {
            let response = match self.transport.announce(tracker, request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("announce failed ({tracker}): {e}");
                    continue;
                }
            };

            debug!("announced to {tracker}: {} peers", response.peers.len());

            for peer in response.peers {
                if peer.node_key == self.node_key {
                    continue;
                }

                // Skip peers we already have a live handler for
                if let Some(handler) = swarm.peer(&peer.node_key) {
                    if handler.state() != ConnectionState::Closed {
                        continue;
                    }
                }

                let client = self.strong_self();
                let swarm = Arc::clone(swarm);
                tokio::spawn(async move {
                    client.connect_peer(&swarm, peer.node_key).await;
                });
            }
        }
    }

    /// Announces every non-paused swarm; the periodic sweep body.
    pub async fn reannounce_all(&self) {
        for swarm in self.swarms_snapshot() {
            if swarm.is_paused() {
                continue;
            }
            self.announce_one(&swarm, AnnounceEvent::None).await;
        }
    }

    /// Starts the periodic reannounce task. It exits on [`Self::shutdown`].
    pub fn spawn_reannounce(&self) {
        let client = self.strong_self();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.network.reannounce_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh import
            // announces through announce_swarm, not the sweep
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => client.reannounce_all().await,
                }
            }
            debug!("reannounce task exited");
        });
    }

    /// Stops background tasks, disconnects every swarm, and closes the
    /// tracker transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        for swarm in self.swarms_snapshot() {
            swarm.disconnect_all(&self.sessions).await;
            swarm.close();
        }

        self.sessions.shutdown();
        self.transport.close().await;
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
