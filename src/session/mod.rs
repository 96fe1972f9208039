//! Session layer: connection ownership, framing, and message dispatch
//!
//! Owns one [`Session`] per remote node over an injected [`Overlay`] and
//! runs a read loop per session. Frames are `u32 big-endian length ‖
//! envelope`; oversize or undecodable frames tear the whole session down.
//! Sessions are ref-counted so every swarm talking to the same peer shares
//! one connection.

pub mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BaobunConfig;
use crate::swarm::peer::PeerHandler;
use crate::swarm::protocol::{Envelope, MAX_FRAME_LEN, MessageCodec, PeerMessage};
use crate::swarm::{InfoHash, NodeKey, Swarm, SwarmError};

/// A byte-stream connection to one remote node.
///
/// Implementations must allow one reader and one writer to operate
/// concurrently; the session layer serializes writers itself.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Reads exactly `buf.len()` bytes.
    async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes all of `buf`.
    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()>;

    /// Closes the connection; further reads fail.
    async fn close(&self);
}

/// Connection-oriented overlay network, injected by the embedding node.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Returns this node's overlay identity.
    fn local_key(&self) -> NodeKey;

    /// Opens a connection to `peer`, observing `timeout`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerUnavailable` - peer unknown or unreachable
    /// - `SwarmError::Timeout` - dial did not complete in time
    async fn dial(
        &self,
        peer: &NodeKey,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, SwarmError>;

    /// Waits for the next inbound connection.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - the overlay stopped accepting
    async fn accept(&self) -> Result<(NodeKey, Box<dyn Connection>), SwarmError>;
}

/// One ref-counted connection to a remote node.
pub struct Session {
    peer: NodeKey,
    conn: Box<dyn Connection>,
    refcount: AtomicUsize,
    write_lock: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(peer: NodeKey, conn: Box<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            conn,
            refcount: AtomicUsize::new(1),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns the remote node this session talks to.
    pub fn peer(&self) -> &NodeKey {
        &self.peer
    }

    /// Writes one length-prefixed frame. The write mutex covers prefix and
    /// body together, so concurrent senders never interleave.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Oversize` - payload exceeds the frame limit
    /// - `SwarmError::Io` - connection write failure
    pub(crate) async fn send_frame(&self, payload: &[u8]) -> Result<(), SwarmError> {
        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(SwarmError::Oversize {
                length: payload.len() as u32,
            });
        }

        let _guard = self.write_lock.lock().await;
        self.conn
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.conn.write_all(payload).await?;
        Ok(())
    }

    /// Reads one length-prefixed frame.
    async fn read_frame(&self) -> Result<Vec<u8>, SwarmError> {
        let mut len_buf = [0u8; 4];
        self.conn.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf);

        if length == 0 || length > MAX_FRAME_LEN {
            return Err(SwarmError::Oversize { length });
        }

        let mut buf = vec![0u8; length as usize];
        self.conn.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

struct Routing {
    sessions: HashMap<NodeKey, Arc<Session>>,
    swarms: HashMap<InfoHash, Arc<Swarm>>,
}

/// Accept/dial multiplexer and frame dispatcher for one node.
pub struct SessionManager {
    overlay: Arc<dyn Overlay>,
    config: BaobunConfig,
    routing: Mutex<Routing>,
    shutdown: watch::Sender<bool>,
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    /// Creates the manager and starts its accept loop.
    pub fn new(overlay: Arc<dyn Overlay>, config: BaobunConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new_cyclic(|self_ref| Self {
            overlay,
            config,
            routing: Mutex::new(Routing {
                sessions: HashMap::new(),
                swarms: HashMap::new(),
            }),
            shutdown,
            self_ref: self_ref.clone(),
        });

        let accept_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            accept_manager.accept_loop().await;
        });

        manager
    }

    /// The manager always lives in an `Arc`; this recovers it for task
    /// spawning.
    fn strong_self(&self) -> Arc<SessionManager> {
        self.self_ref.upgrade().expect("session manager still alive")
    }

    /// Returns this node's overlay identity.
    pub fn local_key(&self) -> NodeKey {
        self.overlay.local_key()
    }

    /// Inserts a swarm into the routing table, keyed by info hash.
    pub fn register_swarm(&self, swarm: Arc<Swarm>) {
        let mut routing = self.routing.lock().expect("routing lock poisoned");
        routing.swarms.insert(swarm.info_hash(), swarm);
    }

    /// Removes a swarm from the routing table.
    pub fn deregister_swarm(&self, info_hash: InfoHash) -> Option<Arc<Swarm>> {
        let mut routing = self.routing.lock().expect("routing lock poisoned");
        routing.swarms.remove(&info_hash)
    }

    /// Looks up a swarm by info hash.
    pub fn swarm(&self, info_hash: InfoHash) -> Option<Arc<Swarm>> {
        let routing = self.routing.lock().expect("routing lock poisoned");
        routing.swarms.get(&info_hash).cloned()
    }

    async fn accept_loop(self: Arc<Self>) {
        debug!("starting the accept loop");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.overlay.accept() => accepted,
            };

            match accepted {
                Ok((peer, conn)) => {
                    info!("accepted session with {peer}");
                    let session = Session::new(peer.clone(), conn);
                    {
                        let mut routing = self.routing.lock().expect("routing lock poisoned");
                        routing.sessions.insert(peer, Arc::clone(&session));
                    }
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.read_loop(session).await;
                    });
                }
                Err(e) => {
                    debug!("accept loop ending: {e}");
                    break;
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, session: Arc<Session>) {
        loop {
            let frame = match session.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("read error from {}: {e}", session.peer);
                    self.teardown_session(&session.peer).await;
                    return;
                }
            };

            let envelope = match MessageCodec::deserialize_envelope(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("undecodable frame from {}: {e}", session.peer);
                    self.teardown_session(&session.peer).await;
                    return;
                }
            };

            if matches!(envelope.message, PeerMessage::Handshake { .. }) {
                self.handle_handshake(&session, envelope).await;
                continue;
            }

            self.dispatch(&session, envelope).await;
        }
    }

    async fn handle_handshake(&self, session: &Arc<Session>, envelope: Envelope) {
        let PeerMessage::Handshake { info_hash, .. } = &envelope.message else {
            return;
        };
        debug!("received handshake from {} for swarm {info_hash}", session.peer);

        let Some(swarm) = self.swarm(*info_hash) else {
            warn!(
                "swarm {info_hash} not found for handshake from {}",
                session.peer
            );
            return;
        };

        let handler = match swarm.peer(&session.peer) {
            Some(handler) => {
                handler.update_session(Arc::clone(session));
                handler
            }
            None => PeerHandler::attach(&swarm, session.peer.clone(), Arc::clone(session)),
        };

        handler.handle_message(envelope.message).await;

        if let Err(e) = handler.send_handshake(self.local_key()).await {
            warn!("failed to send handshake response to {}: {e}", session.peer);
        }
    }

    async fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) {
        let Some(swarm) = self.swarm(envelope.info_hash) else {
            debug!("no swarm for info hash {}", envelope.info_hash);
            return;
        };

        let Some(handler) = swarm.peer(&session.peer) else {
            debug!(
                "no handler for peer {} in swarm {}",
                session.peer, envelope.info_hash
            );
            return;
        };

        handler.handle_message(envelope.message).await;
    }

    /// Tears a session down after a framing or decode failure: the entry is
    /// dropped regardless of refcount, the connection closed, and every
    /// handler riding on it transitions to Closed.
    async fn teardown_session(&self, peer: &NodeKey) {
        let (session, swarms) = {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            (
                routing.sessions.remove(peer),
                routing.swarms.values().cloned().collect::<Vec<_>>(),
            )
        };

        if let Some(session) = session {
            session.conn.close().await;
        }

        for swarm in swarms {
            if let Some(handler) = swarm.peer(peer) {
                handler.close(None).await;
            }
        }
    }

    /// Returns the shared session to `peer`, dialling when none exists.
    /// Each caller owns one reference; drop it with [`Self::release`].
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerUnavailable` / `SwarmError::Timeout` - dial failed
    pub async fn get_session(&self, peer: &NodeKey) -> Result<Arc<Session>, SwarmError> {
        {
            let routing = self.routing.lock().expect("routing lock poisoned");
            if let Some(session) = routing.sessions.get(peer) {
                session.refcount.fetch_add(1, Ordering::SeqCst);
                return Ok(Arc::clone(session));
            }
        }

        let conn = self
            .overlay
            .dial(peer, self.config.network.dial_timeout)
            .await?;

        enum Outcome {
            Existing(Arc<Session>),
            New(Arc<Session>),
        }

        let mut conn = Some(conn);
        let outcome = {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            // Another task may have dialled the same peer while we did
            if let Some(existing) = routing.sessions.get(peer) {
                existing.refcount.fetch_add(1, Ordering::SeqCst);
                Outcome::Existing(Arc::clone(existing))
            } else {
                let session = Session::new(peer.clone(), conn.take().expect("connection present"));
                routing.sessions.insert(peer.clone(), Arc::clone(&session));
                Outcome::New(session)
            }
        };

        let session = match outcome {
            Outcome::Existing(existing) => {
                if let Some(conn) = conn.take() {
                    conn.close().await;
                }
                return Ok(existing);
            }
            Outcome::New(session) => session,
        };

        let manager = self.strong_self();
        let reader = Arc::clone(&session);
        tokio::spawn(async move {
            manager.read_loop(reader).await;
        });

        Ok(session)
    }

    /// Drops one reference to the session; the connection closes when the
    /// last reference goes.
    pub async fn release(&self, peer: &NodeKey) {
        let closing = {
            let mut routing = self.routing.lock().expect("routing lock poisoned");
            let Some(session) = routing.sessions.get(peer) else {
                return;
            };

            if session.refcount.fetch_sub(1, Ordering::SeqCst) > 1 {
                return;
            }
            routing.sessions.remove(peer)
        };

        if let Some(session) = closing {
            session.conn.close().await;
        }
    }

    /// Opens or reuses a session to `peer`, attaches an outbound handler to
    /// `swarm` if none exists, sends our handshake, and waits for the
    /// remote's handshake up to `timeout`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Timeout` - no handshake arrived in time
    /// - dial errors from the overlay
    pub async fn connect_peer(
        &self,
        swarm: &Arc<Swarm>,
        peer: NodeKey,
        timeout: Duration,
    ) -> Result<Arc<PeerHandler>, SwarmError> {
        if let Some(handler) = swarm.peer(&peer) {
            if handler.state() == crate::swarm::ConnectionState::Connected {
                return Ok(handler);
            }
            if handler.wait_for_handshake(timeout).await {
                return Ok(handler);
            }
            return Err(SwarmError::Timeout {
                operation: "handshake",
            });
        }

        let session = self.get_session(&peer).await?;
        let handler = PeerHandler::attach(swarm, peer, session);

        if let Err(e) = handler.send_handshake(self.local_key()).await {
            handler.close(Some(self)).await;
            return Err(e);
        }

        if !handler.wait_for_handshake(timeout).await {
            handler.close(Some(self)).await;
            return Err(SwarmError::Timeout {
                operation: "handshake",
            });
        }

        Ok(handler)
    }

    /// Signals the accept loop to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
