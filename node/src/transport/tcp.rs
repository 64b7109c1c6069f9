//! Local network transport over TCP.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{
    Connection, ConnectionState, FramedConnection, Incoming, PeerHandle, PeerTransport,
    TransportError,
};

const BACKLOG: usize = 64;

/// TCP transport with a static peer list.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    peers: Vec<PeerHandle>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: Vec<PeerHandle>) -> Self {
        Self {
            peers,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bind `addr` and accept inbound connections in the background.
    ///
    /// Returns the bound address and the accepted connections.
    pub async fn listen(addr: &str) -> Result<(SocketAddr, Incoming), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(BACKLOG);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%remote, error = %e, "failed to set TCP_NODELAY");
                        }
                        tracing::debug!(%remote, "accepted peer connection");
                        let conn: Box<dyn Connection> =
                            Box::new(FramedConnection::new(stream, remote.to_string()));
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept peer connection");
                    }
                }
            }
            tracing::debug!(%local, "listener stopped");
        });

        tracing::info!(%local, "listening for peers");
        Ok((local, rx))
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn discover(&self) -> Result<Vec<PeerHandle>, TransportError> {
        Ok(self.peers.clone())
    }

    async fn connect(&self, peer: &PeerHandle) -> Result<Box<dyn Connection>, TransportError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        tracing::debug!(peer = %peer.node_id, address = %peer.address, "connecting");

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&peer.address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                state.send_replace(ConnectionState::Disconnected);
                tracing::debug!(peer = %peer.node_id, error = %e, "connect failed");
                return Err(TransportError::Unreachable(peer.node_id.clone()));
            }
            Err(_) => {
                state.send_replace(ConnectionState::Disconnected);
                return Err(TransportError::Unreachable(peer.node_id.clone()));
            }
        };
        stream.set_nodelay(true)?;

        Ok(Box::new(FramedConnection::with_state(
            stream,
            peer.address.clone(),
            state,
        )))
    }
}
