//! Per-peer connection state machine and message handling
//!
//! One handler exists per `(swarm, peer)` pair, owned by the swarm. The
//! handshake completes when both directions have been seen; only then does
//! the handler advertise availability and take part in scheduling.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::bitfield::Bitfield;
use super::merkle;
use super::protocol::{Envelope, PeerMessage, Proof};
use super::state::Swarm;
use super::{NodeKey, SwarmError, UNIT_SIZE};
use crate::session::{Session, SessionManager};

/// Lifecycle of a peer connection.
///
/// Ordered: a handler only ever moves forward through these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Handler exists, no handshake sent yet
    Connecting,
    /// Our handshake is out, the remote's has not been seen
    Handshaking,
    /// Both handshakes seen; bitfields and transfers flow
    Connected,
    /// Torn down; the handler is dead
    Closed,
}

#[derive(Default)]
struct HandshakeFlags {
    our_sent: bool,
    their_seen: bool,
}

/// Rolling bandwidth window: samples decay out after `window`.
struct RateMeter {
    window: Duration,
    samples: Vec<(Instant, usize)>,
    total: u64,
}

impl RateMeter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Vec::new(),
            total: 0,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.total += bytes as u64;
        self.samples.push((Instant::now(), bytes));
    }

    fn windowed_sum(&mut self) -> u64 {
        if let Some(cutoff) = Instant::now().checked_sub(self.window) {
            self.samples.retain(|(at, _)| *at > cutoff);
        }
        self.samples.iter().map(|(_, n)| *n as u64).sum()
    }

    fn total(&self) -> u64 {
        self.total
    }
}

/// Per-peer connection handler: state machine, message handling, and
/// bandwidth accounting for one `(swarm, peer)` pair.
pub struct PeerHandler {
    peer: NodeKey,
    swarm: Weak<Swarm>,
    session: RwLock<Arc<Session>>,
    remote_bits: Mutex<Option<Bitfield>>,
    state: watch::Sender<ConnectionState>,
    hs_flags: Mutex<HandshakeFlags>,
    hs_seen: watch::Sender<bool>,
    upload: Mutex<RateMeter>,
    download: Mutex<RateMeter>,
}

impl PeerHandler {
    /// Creates a handler and registers it with the swarm before any message
    /// can race it.
    pub fn attach(swarm: &Arc<Swarm>, peer: NodeKey, session: Arc<Session>) -> Arc<Self> {
        let window = swarm.config().network.bandwidth_window;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (hs_seen, _) = watch::channel(false);

        let handler = Arc::new(Self {
            peer,
            swarm: Arc::downgrade(swarm),
            session: RwLock::new(session),
            remote_bits: Mutex::new(None),
            state,
            hs_flags: Mutex::new(HandshakeFlags::default()),
            hs_seen,
            upload: Mutex::new(RateMeter::new(window)),
            download: Mutex::new(RateMeter::new(window)),
        });

        swarm.insert_peer(Arc::clone(&handler));
        handler
    }

    /// Returns the remote node this handler talks to.
    pub fn peer(&self) -> &NodeKey {
        &self.peer
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Points the handler at a newer session, e.g. after an inbound
    /// reconnect replaced the connection.
    pub(crate) fn update_session(&self, session: Arc<Session>) {
        *self.session.write().expect("session lock poisoned") = session;
    }

    /// Waits until the remote's handshake has been seen.
    pub async fn wait_for_handshake(&self, timeout: Duration) -> bool {
        let mut seen = self.hs_seen.subscribe();
        tokio::time::timeout(timeout, seen.wait_for(|seen| *seen))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Waits until the handler reaches Connected. Returns false on timeout
    /// or when the handler closed first.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        match tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s >= ConnectionState::Connected),
        )
        .await
        {
            Ok(Ok(state)) => *state == ConnectionState::Connected,
            _ => false,
        }
    }

    /// Sends one message on the session, framed and serialized.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerUnavailable` - owning swarm is gone
    /// - `SwarmError::Io` / `SwarmError::Oversize` - session write failure
    pub async fn send(&self, message: PeerMessage) -> Result<(), SwarmError> {
        let Some(swarm) = self.swarm.upgrade() else {
            return Err(SwarmError::PeerUnavailable {
                peer: self.peer.clone(),
            });
        };

        let envelope = Envelope {
            info_hash: swarm.info_hash(),
            message,
        };
        let payload = crate::swarm::protocol::MessageCodec::serialize_envelope(&envelope);

        let session = Arc::clone(&self.session.read().expect("session lock poisoned"));
        session.send_frame(&payload).await
    }

    /// Sends our handshake once; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// - session write failures from [`Self::send`]
    pub async fn send_handshake(&self, local_key: NodeKey) -> Result<(), SwarmError> {
        {
            let flags = self.hs_flags.lock().expect("handshake flags lock poisoned");
            if flags.our_sent {
                return Ok(());
            }
        }

        let Some(swarm) = self.swarm.upgrade() else {
            return Err(SwarmError::PeerUnavailable {
                peer: self.peer.clone(),
            });
        };

        self.send(PeerMessage::Handshake {
            info_hash: swarm.info_hash(),
            peer_id: local_key,
        })
        .await?;

        {
            let mut flags = self.hs_flags.lock().expect("handshake flags lock poisoned");
            flags.our_sent = true;
        }
        self.state.send_if_modified(|s| {
            if *s < ConnectionState::Handshaking {
                *s = ConnectionState::Handshaking;
                true
            } else {
                false
            }
        });

        self.maybe_connected().await;
        Ok(())
    }

    /// Transitions to Connected once both handshakes are in, and sends the
    /// upload bitfield exactly once on that edge.
    async fn maybe_connected(&self) {
        let both = {
            let flags = self.hs_flags.lock().expect("handshake flags lock poisoned");
            flags.our_sent && flags.their_seen
        };
        if !both {
            return;
        }

        let became_connected = self.state.send_if_modified(|s| {
            if *s < ConnectionState::Connected {
                *s = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !became_connected {
            return;
        }

        let Some(swarm) = self.swarm.upgrade() else {
            return;
        };
        let bits = swarm.upload_bitfield_bytes();
        debug!(
            "sending bitfield to {}:\n{}",
            self.peer,
            Bitfield::from_bytes(bits.clone()).render(swarm.store().unit_count())
        );
        if let Err(e) = self.send(PeerMessage::Bitfield { bits: bits.into() }).await {
            // Not fatal; the peer can still learn availability from Have
            warn!("bitfield send to {} failed: {e}", self.peer);
        }
    }

    /// Handles one inbound message.
    pub async fn handle_message(&self, message: PeerMessage) {
        match message {
            PeerMessage::Handshake { .. } => {
                {
                    let mut flags = self.hs_flags.lock().expect("handshake flags lock poisoned");
                    flags.their_seen = true;
                }
                self.hs_seen.send_replace(true);
                self.maybe_connected().await;
            }

            PeerMessage::Bitfield { bits } => {
                let Some(swarm) = self.swarm.upgrade() else {
                    return;
                };
                {
                    let mut remote = self.remote_bits.lock().expect("remote bits lock poisoned");
                    let mut incoming = Bitfield::from_bytes(bits.to_vec());
                    if let Some(existing) = remote.as_ref() {
                        // Keep bits learned from Have messages that raced
                        // ahead of the initial snapshot
                        incoming.merge(existing);
                    }
                    debug!(
                        "received bitfield from {}:\n{}",
                        self.peer,
                        incoming.render(swarm.store().unit_count())
                    );
                    *remote = Some(incoming);
                }
                swarm.scheduler().kick();
            }

            PeerMessage::Have { unit_index } => {
                let Some(swarm) = self.swarm.upgrade() else {
                    return;
                };
                let mut remote = self.remote_bits.lock().expect("remote bits lock poisoned");
                remote
                    .get_or_insert_with(|| Bitfield::new(swarm.store().unit_count()))
                    .set(unit_index);
            }

            PeerMessage::Request { unit_index } => {
                self.handle_request(unit_index).await;
            }

            PeerMessage::Transfer {
                unit_index,
                data,
                proof,
            } => {
                self.handle_transfer(unit_index, data, proof).await;
            }

            PeerMessage::Reject { unit_index, reason } => {
                // Reserved: the request timeout reschedules the unit
                debug!("peer {} rejected unit {unit_index}: {reason}", self.peer);
            }
        }
    }

    async fn handle_request(&self, unit_index: u64) {
        let Some(swarm) = self.swarm.upgrade() else {
            return;
        };

        // Only serve units we can prove; anything else is silently dropped
        // and the requester's timeout handles it
        if !swarm.can_serve(unit_index) {
            debug!(
                "dropping request for unit {unit_index} from {}: cannot serve",
                self.peer
            );
            return;
        }

        let data = match swarm.store().read_unit(unit_index) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to read unit {unit_index} for {}: {e}", self.peer);
                return;
            }
        };

        if let Err(e) = self.send_transfer(&swarm, unit_index, data).await {
            warn!("failed to send unit {unit_index} to {}: {e}", self.peer);
        }
    }

    /// Reads or generates the unit's proof and sends the transfer.
    ///
    /// A freshly generated proof is only trusted after the recomputed root
    /// matches the descriptor; a mismatch means the local file was modified
    /// and the send is aborted.
    async fn send_transfer(
        &self,
        swarm: &Arc<Swarm>,
        unit_index: u64,
        data: Vec<u8>,
    ) -> Result<(), SwarmError> {
        let proof = match swarm.proofs().get(unit_index) {
            Some(proof) => {
                debug!("using cached proof for unit {unit_index}");
                proof
            }
            None => {
                let offset = unit_index * UNIT_SIZE;
                let length = data.len() as u64;
                let (proof, root) = swarm.store().with_file(|file| {
                    merkle::generate_proof(file, swarm.descriptor().length, offset, length)
                })?;

                if root != swarm.descriptor().root() {
                    return Err(SwarmError::BadProof {
                        reason: "generated root does not match descriptor: file may have been \
                                 modified"
                            .to_string(),
                    });
                }

                if let Err(e) = swarm.proofs().save(unit_index, &proof) {
                    warn!("failed to persist generated proof for unit {unit_index}: {e}");
                }
                proof
            }
        };

        let transferred = data.len();
        self.send(PeerMessage::Transfer {
            unit_index,
            data: Bytes::from(data),
            proof: Some(proof),
        })
        .await?;

        swarm.add_uploaded(transferred as u64);
        self.record_upload(transferred);
        Ok(())
    }

    async fn handle_transfer(&self, unit_index: u64, data: Bytes, proof: Option<Proof>) {
        let Some(swarm) = self.swarm.upgrade() else {
            return;
        };

        let Some(proof) = proof else {
            warn!("missing proof for unit {unit_index} from {}", self.peer);
            return;
        };

        // The proof must authenticate the unit we asked for, not an
        // arbitrary leaf range of the sender's choosing
        if proof.leaf_start != unit_index * (UNIT_SIZE / merkle::LEAF_SIZE) {
            warn!(
                "proof for unit {unit_index} from {} covers wrong leaf range (starts at {})",
                self.peer, proof.leaf_start
            );
            return;
        }

        if let Err(e) = merkle::verify_proof(
            &data,
            &proof,
            &swarm.descriptor().root(),
            swarm.descriptor().length,
        ) {
            warn!(
                "proof verification failed for unit {unit_index} from {}: {e}",
                self.peer
            );
            return;
        }

        self.record_download(data.len());

        if let Err(e) = swarm.store().write_unit(unit_index, &data) {
            warn!("failed to write unit {unit_index} to disk: {e}");
            return;
        }

        if let Err(e) = swarm.proofs().save(unit_index, &proof) {
            warn!("failed to persist proof for unit {unit_index}: {e}");
        }

        swarm.mark_unit_complete(unit_index, data.len() as u64).await;
    }

    /// Sends a Have for one unit.
    ///
    /// # Errors
    ///
    /// - session write failures from [`Self::send`]
    pub async fn send_have(&self, unit_index: u64) -> Result<(), SwarmError> {
        self.send(PeerMessage::Have { unit_index }).await
    }

    /// Sends a request for one unit.
    ///
    /// # Errors
    ///
    /// - session write failures from [`Self::send`]
    pub async fn send_request(&self, unit_index: u64) -> Result<(), SwarmError> {
        self.send(PeerMessage::Request { unit_index }).await
    }

    /// Returns whether the remote has advertised `unit`. False until a
    /// Bitfield or Have has arrived.
    pub fn remote_has(&self, unit: u64) -> bool {
        self.remote_bits
            .lock()
            .expect("remote bits lock poisoned")
            .as_ref()
            .is_some_and(|bits| bits.has(unit))
    }

    /// Returns whether any remote availability is known yet.
    pub fn has_remote_bitfield(&self) -> bool {
        self.remote_bits
            .lock()
            .expect("remote bits lock poisoned")
            .is_some()
    }

    /// Closes the handler: state goes to Closed, the swarm forgets it, and
    /// the session reference is released when a manager is given.
    pub async fn close(&self, manager: Option<&SessionManager>) {
        self.state.send_replace(ConnectionState::Closed);

        if let Some(swarm) = self.swarm.upgrade() {
            swarm.remove_peer(&self.peer);
        }

        if let Some(manager) = manager {
            manager.release(&self.peer).await;
        }

        info!("closed connection to peer {}", self.peer);
    }

    fn record_upload(&self, bytes: usize) {
        self.upload
            .lock()
            .expect("upload meter lock poisoned")
            .record(bytes);
    }

    fn record_download(&self, bytes: usize) {
        self.download
            .lock()
            .expect("download meter lock poisoned")
            .record(bytes);
    }

    /// Raw bytes uploaded to this peer within the sampling window.
    pub fn upload_rate(&self) -> u64 {
        self.upload
            .lock()
            .expect("upload meter lock poisoned")
            .windowed_sum()
    }

    /// Bytes per second downloaded from this peer, averaged over the
    /// sampling window. Note the asymmetry with [`Self::upload_rate`],
    /// which reports the raw windowed sum.
    pub fn download_rate(&self) -> u64 {
        let mut meter = self.download.lock().expect("download meter lock poisoned");
        let window_secs = meter.window.as_secs().max(1);
        meter.windowed_sum() / window_secs
    }

    /// Total bytes uploaded to this peer over the handler's lifetime.
    pub fn uploaded_total(&self) -> u64 {
        self.upload
            .lock()
            .expect("upload meter lock poisoned")
            .total()
    }

    /// Total bytes downloaded from this peer over the handler's lifetime.
    pub fn downloaded_total(&self) -> u64 {
        self.download
            .lock()
            .expect("download meter lock poisoned")
            .total()
    }
}
