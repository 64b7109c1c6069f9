//! Peer transports.
//!
//! A transport finds peers and opens connections to them. A connection moves
//! opaque frames; the sync protocol on top decides what they mean. Every
//! connection publishes its state on a watch channel, moving from
//! `Connecting` to `Connected` and ending in `Disconnected`.

mod framed;
mod memory;
mod tcp;

pub use framed::FramedConnection;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tandem_engine::NodeId;
use tokio::sync::{mpsc, watch};

/// A reachable peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    pub node_id: NodeId,
    /// Transport specific address
    pub address: String,
}

impl PeerHandle {
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }
}

/// Lifecycle of a connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound connections accepted by a transport.
pub type Incoming = mpsc::Receiver<Box<dyn Connection>>;

/// Finds peers and connects to them.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Peers currently worth syncing with.
    async fn discover(&self) -> Result<Vec<PeerHandle>, TransportError>;

    /// Open a connection to a peer.
    async fn connect(&self, peer: &PeerHandle) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open, ordered, reliable frame stream to a peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human readable remote address.
    fn remote(&self) -> &str;

    /// Subscribe to state changes.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Wait for the next frame.
    async fn receive(&mut self) -> Result<Bytes, TransportError>;

    /// Close the connection. Further sends and receives fail with
    /// [`TransportError::Closed`].
    async fn disconnect(&mut self);
}
