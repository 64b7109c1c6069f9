//! In-process transport.
//!
//! Nodes joined to the same [`MemoryNetwork`] reach each other over
//! in-memory duplex pipes. Taking a node offline makes it undiscoverable
//! and unreachable, which is how tests model a device without coverage.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tandem_engine::NodeId;
use tokio::sync::mpsc;

use super::{Connection, FramedConnection, Incoming, PeerHandle, PeerTransport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;
const BACKLOG: usize = 32;

/// A shared in-process network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<NodeId, mpsc::Sender<Box<dyn Connection>>>>,
    offline: Arc<RwLock<HashSet<NodeId>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node. Returns its transport and the stream of connections
    /// other nodes open to it.
    pub fn join(&self, node_id: impl Into<NodeId>) -> (MemoryTransport, Incoming) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(BACKLOG);
        self.listeners.insert(node_id.clone(), tx);
        tracing::debug!(node_id = %node_id, "joined memory network");
        (
            MemoryTransport {
                node_id,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Take a node off or back onto the network.
    pub fn set_online(&self, node_id: &str, online: bool) {
        if let Ok(mut offline) = self.offline.write() {
            if online {
                offline.remove(node_id);
            } else {
                offline.insert(node_id.to_string());
            }
        }
    }

    pub fn is_online(&self, node_id: &str) -> bool {
        self.offline
            .read()
            .map(|offline| !offline.contains(node_id))
            .unwrap_or(false)
    }

    /// Handle for reaching a node on this network.
    pub fn handle(node_id: &str) -> PeerHandle {
        PeerHandle::new(node_id, format!("memory://{node_id}"))
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn discover(&self) -> Result<Vec<PeerHandle>, TransportError> {
        if !self.network.is_online(&self.node_id) {
            return Ok(Vec::new());
        }
        let mut peers: Vec<PeerHandle> = self
            .network
            .listeners
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| id != &self.node_id && self.network.is_online(id))
            .map(|id| MemoryNetwork::handle(&id))
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(peers)
    }

    async fn connect(&self, peer: &PeerHandle) -> Result<Box<dyn Connection>, TransportError> {
        if !self.network.is_online(&self.node_id) || !self.network.is_online(&peer.node_id) {
            return Err(TransportError::Unreachable(peer.node_id.clone()));
        }
        let listener = self
            .network
            .listeners
            .get(&peer.node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(peer.node_id.clone()))?;

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = FramedConnection::new(remote, format!("memory://{}", self.node_id));
        listener
            .send(Box::new(inbound))
            .await
            .map_err(|_| TransportError::Unreachable(peer.node_id.clone()))?;

        Ok(Box::new(FramedConnection::new(local, peer.address.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionState;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_discover_skips_self_and_offline() {
        let network = MemoryNetwork::new();
        let (a, _a_in) = network.join("a");
        let (_b, _b_in) = network.join("b");
        let (_c, _c_in) = network.join("c");

        let peers = a.discover().await.unwrap();
        assert_eq!(peers, vec![MemoryNetwork::handle("b"), MemoryNetwork::handle("c")]);

        network.set_online("c", false);
        let peers = a.discover().await.unwrap();
        assert_eq!(peers, vec![MemoryNetwork::handle("b")]);

        network.set_online("a", false);
        assert!(a.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_delivers_inbound_connection() {
        let network = MemoryNetwork::new();
        let (a, _a_in) = network.join("a");
        let (_b, mut b_in) = network.join("b");

        let mut outbound = a.connect(&MemoryNetwork::handle("b")).await.unwrap();
        let mut inbound = b_in.recv().await.unwrap();
        assert_eq!(inbound.remote(), "memory://a");
        assert_eq!(*outbound.state().borrow(), ConnectionState::Connected);

        outbound.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(inbound.receive().await.unwrap(), Bytes::from_static(b"ping"));

        outbound.disconnect().await;
        assert!(matches!(inbound.receive().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_offline_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let (a, _a_in) = network.join("a");
        let (_b, _b_in) = network.join("b");

        network.set_online("b", false);
        let result = a.connect(&MemoryNetwork::handle("b")).await;
        assert!(matches!(result, Err(TransportError::Unreachable(id)) if id == "b"));

        let result = a.connect(&MemoryNetwork::handle("nobody")).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
