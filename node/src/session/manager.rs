//! Session manager.
//!
//! Tracks the active sync session per peer. A peer has at most one session
//! at a time; sessions with different peers run concurrently.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tandem_engine::NodeId;

use super::{Role, SessionState};
use crate::error::NodeError;

/// A running session, as reported on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer: NodeId,
    pub role: Role,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

/// Manages active sync sessions.
///
/// Thread-safe and can be shared across tasks via `Arc`.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<NodeId, SessionInfo>,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a new session manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a session with `peer`.
    ///
    /// Fails with [`NodeError::SessionActive`] while another session with the
    /// same peer is registered. The session stays registered until the
    /// returned guard is dropped.
    pub fn begin(
        self: &Arc<Self>,
        peer: &str,
        role: Role,
        session_id: &str,
    ) -> Result<SessionGuard, NodeError> {
        match self.sessions.entry(peer.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!(
                    peer = %peer,
                    session_id = %existing.get().session_id,
                    "refusing second session with peer"
                );
                Err(NodeError::SessionActive(peer.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionInfo {
                    session_id: session_id.to_string(),
                    peer: peer.to_string(),
                    role,
                    state: SessionState::Idle,
                    started_at: Utc::now(),
                });
                tracing::debug!(peer = %peer, session_id = %session_id, ?role, "session registered");
                Ok(SessionGuard {
                    manager: Arc::clone(self),
                    peer: peer.to_string(),
                    session_id: session_id.to_string(),
                })
            }
        }
    }

    fn update(&self, peer: &str, session_id: &str, state: SessionState) {
        if let Some(mut info) = self.sessions.get_mut(peer) {
            if info.session_id == session_id {
                info.state = state;
            }
        }
    }

    fn end(&self, peer: &str, session_id: &str) {
        let removed = self
            .sessions
            .remove_if(peer, |_, info| info.session_id == session_id);
        if removed.is_some() {
            tracing::debug!(peer = %peer, session_id = %session_id, "session unregistered");
        }
    }

    /// Whether a session with `peer` is registered.
    pub fn is_active(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Get the number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// All active sessions, ordered by peer.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.peer.cmp(&b.peer));
        sessions
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    peer: NodeId,
    session_id: String,
}

impl SessionGuard {
    pub fn set_state(&self, state: SessionState) {
        self.manager.update(&self.peer, &self.session_id, state);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.end(&self.peer, &self.session_id);
    }
}
