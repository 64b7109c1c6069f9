//! Tandem Node - peer daemon for offline-first sync.
//!
//! Wraps a [`tandem_engine::Replica`] with SQLite persistence, peer
//! transports and the session protocol that exchanges deltas between
//! replicas. A small HTTP surface exposes health and status.

pub mod config;
pub mod db;
pub mod error;
pub mod node;
pub mod routes;
pub mod schema;
pub mod session;
pub mod transport;

use std::sync::Arc;

pub use config::{Config, SessionConfig};
pub use error::{AppError, NodeError, Result};
pub use node::{NodeStatus, SyncNode};
pub use session::{SessionReport, SessionState};
pub use transport::{MemoryNetwork, PeerHandle, PeerTransport, TcpTransport};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<SyncNode>,
}
