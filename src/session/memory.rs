//! In-process overlay: paired duplex streams behind a shared registry
//!
//! Lets several nodes run inside one process for tests and simulations.
//! Dialling a joined node hands it the far end of a duplex pipe through its
//! accept queue; nothing leaves the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use super::{Connection, Overlay};
use crate::swarm::{NodeKey, SwarmError};

const PIPE_CAPACITY: usize = 256 * 1024;

type IncomingConn = (NodeKey, MemoryConnection);

/// Shared registry of in-process nodes.
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<NodeKey, mpsc::Sender<IncomingConn>>>,
    self_ref: Weak<MemoryNetwork>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            nodes: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Joins the network under `key`, returning that node's overlay.
    pub fn join(&self, key: NodeKey) -> MemoryOverlay {
        let (tx, rx) = mpsc::channel(16);
        self.nodes
            .lock()
            .expect("memory network lock poisoned")
            .insert(key.clone(), tx);

        MemoryOverlay {
            key,
            network: self.self_ref.upgrade().expect("memory network still alive"),
            incoming: tokio::sync::Mutex::new(rx),
        }
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryOverlay {
    key: NodeKey,
    network: Arc<MemoryNetwork>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<IncomingConn>>,
}

#[async_trait]
impl Overlay for MemoryOverlay {
    fn local_key(&self) -> NodeKey {
        self.key.clone()
    }

    async fn dial(
        &self,
        peer: &NodeKey,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>, SwarmError> {
        let target = self
            .network
            .nodes
            .lock()
            .expect("memory network lock poisoned")
            .get(peer)
            .cloned();
        let Some(target) = target else {
            return Err(SwarmError::PeerUnavailable { peer: peer.clone() });
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        target
            .send((self.key.clone(), MemoryConnection::new(far)))
            .await
            .map_err(|_| SwarmError::PeerUnavailable { peer: peer.clone() })?;

        Ok(Box::new(MemoryConnection::new(near)))
    }

    async fn accept(&self) -> Result<(NodeKey, Box<dyn Connection>), SwarmError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some((peer, conn)) => Ok((peer, Box::new(conn))),
            None => Err(SwarmError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory network closed",
            ))),
        }
    }
}

/// One end of an in-process duplex pipe.
pub struct MemoryConnection {
    reader: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    writer: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
}

impl MemoryConnection {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut reader = self.reader.lock().await;
        reader.read_exact(buf).await.map(|_| ())
    }

    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
