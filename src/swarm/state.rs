//! The swarm itself: one descriptor bound to its store, proofs, peers, and
//! scheduler

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use super::descriptor::Descriptor;
use super::peer::{ConnectionState, PeerHandler};
use super::proof_cache::ProofCache;
use super::protocol::Proof;
use super::scheduler::Scheduler;
use super::store::UnitStore;
use super::{InfoHash, NodeKey, SwarmError};
use crate::config::BaobunConfig;
use crate::session::SessionManager;

/// Runtime binding of one descriptor: store, proof cache, peers, counters,
/// and the transfer scheduler.
pub struct Swarm {
    descriptor: Arc<Descriptor>,
    info_hash: InfoHash,
    store: UnitStore,
    proofs: ProofCache,
    peers: RwLock<HashMap<NodeKey, Arc<PeerHandler>>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    location: PathBuf,
    scheduler: Scheduler,
    paused: AtomicBool,
    config: BaobunConfig,
    shutdown: watch::Sender<bool>,
}

impl Swarm {
    /// Opens a swarm at `location`: backing file, startup unit scan, proof
    /// cache load, and the scheduler worker.
    ///
    /// Must run inside a Tokio runtime (the scheduler worker is spawned
    /// here).
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - store open or startup scan failure
    pub fn open(
        descriptor: Descriptor,
        location: impl Into<PathBuf>,
        config: BaobunConfig,
    ) -> Result<Arc<Self>, SwarmError> {
        let descriptor = Arc::new(descriptor);
        let info_hash = descriptor.info_hash();
        let location = location.into();

        let store = UnitStore::open(Arc::clone(&descriptor), &location)?;
        let marked = store.scan_existing_units()?;
        if marked > 0 {
            info!("startup scan found {marked} units already on disk");
        }

        let proofs = ProofCache::new(&location, info_hash);
        let (loaded, failures) = proofs.load_from_disk();
        if failures > 0 {
            warn!("proof cache load skipped {failures} invalid records");
        }
        if loaded > 0 {
            info!("loaded {loaded} proofs from disk cache");
        }

        let (scheduler, events) = Scheduler::new(
            store.unit_count(),
            store.bitfield(),
            config.scheduler.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        let swarm = Arc::new(Self {
            descriptor,
            info_hash,
            store,
            proofs,
            peers: RwLock::new(HashMap::new()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            location,
            scheduler,
            paused: AtomicBool::new(false),
            config,
            shutdown,
        });

        Scheduler::spawn_worker(&swarm, events);
        Ok(swarm)
    }

    /// Returns the swarm's descriptor.
    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    /// Returns the swarm's info hash.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Returns the chunked file store.
    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    /// Returns the proof cache.
    pub fn proofs(&self) -> &ProofCache {
        &self.proofs
    }

    /// Returns the transfer scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns the engine configuration this swarm runs under.
    pub fn config(&self) -> &BaobunConfig {
        &self.config
    }

    /// Returns the directory the backing file lives in.
    pub fn location(&self) -> &PathBuf {
        &self.location
    }

    /// Returns a receiver that flips when the swarm shuts down.
    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Total bytes served to peers.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Total bytes received from peers.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub(crate) fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns whether the swarm is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Bytes still missing, as reported to trackers.
    pub fn calc_left(&self) -> u64 {
        let have = self.store.bitfield();
        let mut left = 0;
        for index in 0..self.store.unit_count() {
            if have.has(index) {
                continue;
            }
            left += self.descriptor.unit_size(index).unwrap_or(0);
        }
        left
    }

    /// Looks up the handler for `peer`.
    pub fn peer(&self, peer: &NodeKey) -> Option<Arc<PeerHandler>> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .get(peer)
            .cloned()
    }

    pub(crate) fn insert_peer(&self, handler: Arc<PeerHandler>) {
        self.peers
            .write()
            .expect("peer map lock poisoned")
            .insert(handler.peer().clone(), handler);
    }

    pub(crate) fn remove_peer(&self, peer: &NodeKey) {
        self.peers
            .write()
            .expect("peer map lock poisoned")
            .remove(peer);
    }

    /// Returns a snapshot of every attached peer handler.
    pub fn peers_snapshot(&self) -> Vec<Arc<PeerHandler>> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Returns whether we may advertise and serve unit `index`: the unit is
    /// on disk, and either the file is complete (proofs generable on
    /// demand) or a cached proof exists.
    pub fn can_serve(&self, index: u64) -> bool {
        if !self.store.has_unit(index) {
            return false;
        }
        if self.store.all_units() {
            return true;
        }
        self.proofs.has(index)
    }

    /// Returns whether a proof for `index` is cached.
    pub fn has_proof(&self, index: u64) -> bool {
        self.proofs.has(index)
    }

    /// Returns a clone of the cached proof for `index`.
    pub fn proof(&self, index: u64) -> Option<Proof> {
        self.proofs.get(index)
    }

    /// The bitfield we advertise: everything on disk when complete,
    /// otherwise only units with a cached proof.
    pub fn upload_bitfield_bytes(&self) -> Vec<u8> {
        let have = self.store.bitfield();
        if have.all_set(self.store.unit_count()) {
            return have.bytes().to_vec();
        }

        let mut out = super::bitfield::Bitfield::new(self.store.unit_count());
        for index in 0..self.store.unit_count() {
            if have.has(index) && self.proofs.has(index) {
                out.set(index);
            }
        }
        out.bytes().to_vec()
    }

    /// Records a completed download: counters, scheduler, and a Have
    /// broadcast to every connected peer.
    pub async fn mark_unit_complete(&self, index: u64, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.scheduler.notify_complete(index);
        self.broadcast_have(index).await;
    }

    /// Fans a Have for `index` out to all connected peers, but only when we
    /// could actually serve a resulting request.
    pub async fn broadcast_have(&self, index: u64) {
        if !self.can_serve(index) {
            return;
        }

        for handler in self.peers_snapshot() {
            if handler.state() != ConnectionState::Connected {
                continue;
            }
            tokio::spawn(async move {
                if let Err(e) = handler.send_have(index).await {
                    warn!("have broadcast to {} failed: {e}", handler.peer());
                }
            });
        }
    }

    /// Marks every unit present and complete. Used when importing a file
    /// the node already fully has (seeding).
    pub async fn mark_all_units_available(&self) {
        self.store.mark_all_units();
        self.scheduler.mark_all_complete().await;
    }

    /// Closes every peer handler.
    pub async fn disconnect_all(&self, manager: &SessionManager) {
        for handler in self.peers_snapshot() {
            handler.close(Some(manager)).await;
        }
    }

    /// Stops the scheduler worker and flushes the store.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.store.sync() {
            warn!("failed to sync store for {}: {e}", self.info_hash);
        }
    }
}
