//! The session state machine.
//!
//! Both sides walk the same states. In every exchange the initiator speaks
//! first. During transfer the initiator streams all of its batches before
//! the responder streams its own, so neither side ever waits on a peer that
//! is itself waiting.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tandem_engine::{BatchOutcome, HlcTimestamp, NodeId, VectorSummary};

use super::protocol::{into_batches, ProtocolError, SyncMessage};
use super::{Role, SessionGuard, SessionState};
use crate::db::{self, SyncCursor};
use crate::error::{NodeError, Result};
use crate::node::SyncNode;
use crate::transport::{Connection, PeerHandle};

/// Bound on delivering an abort notice to a peer that may be gone.
const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub peer: NodeId,
    pub role: Role,
    /// Both sides were unchanged since the last settled exchange
    pub fast_path: bool,
    /// Operations sent to the peer
    pub sent: usize,
    /// Operations received that changed local state
    pub applied: usize,
    /// Operations received that did not
    pub rejected: usize,
    /// Rejected operations that failed validation
    pub malformed: usize,
}

impl SessionReport {
    fn record(&mut self, outcome: &BatchOutcome) {
        self.applied += outcome.applied_count();
        self.rejected += outcome.rejected_count();
        self.malformed += outcome.malformed_count();
    }
}

/// One sync session over one connection.
pub struct SyncSession<'a> {
    node: &'a SyncNode,
    conn: Box<dyn Connection>,
    state: SessionState,
    guard: Option<SessionGuard>,
    expected_peer: Option<NodeId>,
    report: SessionReport,
}

impl<'a> SyncSession<'a> {
    /// A session this node opened towards `peer`.
    pub fn initiator(
        node: &'a SyncNode,
        conn: Box<dyn Connection>,
        peer: &PeerHandle,
        guard: SessionGuard,
        session_id: String,
    ) -> Self {
        Self::new(node, conn, Role::Initiator, Some(guard), Some(peer.node_id.clone()), session_id)
    }

    /// A session a peer opened towards this node. It registers with the
    /// session manager once the peer has identified itself.
    pub fn responder(node: &'a SyncNode, conn: Box<dyn Connection>) -> Self {
        Self::new(node, conn, Role::Responder, None, None, String::new())
    }

    fn new(
        node: &'a SyncNode,
        conn: Box<dyn Connection>,
        role: Role,
        guard: Option<SessionGuard>,
        expected_peer: Option<NodeId>,
        session_id: String,
    ) -> Self {
        let peer = expected_peer.clone().unwrap_or_default();
        Self {
            node,
            conn,
            state: SessionState::Idle,
            guard,
            expected_peer,
            report: SessionReport {
                session_id,
                peer,
                role,
                fast_path: false,
                sent: 0,
                applied: 0,
                rejected: 0,
                malformed: 0,
            },
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion and close the connection.
    pub async fn run(mut self) -> Result<SessionReport> {
        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            self.abort(e).await;
        }
        self.conn.disconnect().await;
        outcome.map(|()| self.report)
    }

    async fn drive(&mut self) -> Result<()> {
        self.transition(SessionState::Handshaking);
        self.handshake().await?;

        self.transition(SessionState::ExchangingVectors);
        let local = self.node.version_summary().await;
        let remote = match self
            .exchange(SyncMessage::VectorSummary {
                entities: local.clone(),
            })
            .await?
        {
            SyncMessage::VectorSummary { entities } => entities,
            other => return Err(unexpected("vector_summary", &other)),
        };

        self.transition(SessionState::ComputingDelta);
        let wanted = self.plan(&local, &remote).await?;
        let requested = match self.exchange(SyncMessage::DeltaRequest { since: wanted }).await? {
            SyncMessage::DeltaRequest { since } => since,
            other => return Err(unexpected("delta_request", &other)),
        };

        match self.report.role {
            Role::Initiator => {
                self.transition(SessionState::TransferringDelta);
                self.send_delta(&requested).await?;
                self.transition(SessionState::Applying);
                self.receive_delta().await?;
            }
            Role::Responder => {
                self.transition(SessionState::Applying);
                self.receive_delta().await?;
                self.transition(SessionState::TransferringDelta);
                self.send_delta(&requested).await?;
            }
        }

        self.transition(SessionState::Acknowledging);
        self.acknowledge().await
    }

    async fn handshake(&mut self) -> Result<()> {
        let peer_clock = match self.report.role {
            Role::Initiator => {
                let hello = self.hello().await;
                self.send(&hello).await?;
                let reply = self.receive().await?;
                self.accept_hello(reply)?
            }
            Role::Responder => {
                let opening = self.receive().await?;
                let peer_clock = self.accept_hello(opening)?;
                let guard = self.node.sessions().begin(
                    &self.report.peer,
                    Role::Responder,
                    &self.report.session_id,
                )?;
                guard.set_state(self.state);
                self.guard = Some(guard);
                let hello = self.hello().await;
                self.send(&hello).await?;
                peer_clock
            }
        };

        let now = self.node.receive_clock(&peer_clock).await;
        tracing::info!(
            node_id = %self.node.node_id(),
            peer = %self.report.peer,
            session_id = %self.report.session_id,
            role = ?self.report.role,
            clock = %now,
            "sync session started"
        );
        Ok(())
    }

    async fn hello(&self) -> SyncMessage {
        SyncMessage::Hello {
            node_id: self.node.node_id().clone(),
            clock: self.node.clock().await,
            schema_version: self.node.schema_version(),
            session_id: self.report.session_id.clone(),
        }
    }

    /// Check the peer's hello and adopt its identity.
    fn accept_hello(&mut self, msg: SyncMessage) -> Result<HlcTimestamp> {
        let (node_id, clock, schema_version, session_id) = match msg {
            SyncMessage::Hello {
                node_id,
                clock,
                schema_version,
                session_id,
            } => (node_id, clock, schema_version, session_id),
            other => return Err(unexpected("hello", &other)),
        };

        if let Some(expected) = &self.expected_peer {
            if expected != &node_id {
                return Err(ProtocolError::WrongPeer {
                    expected: expected.clone(),
                    got: node_id,
                }
                .into());
            }
        }
        if schema_version != self.node.schema_version() {
            return Err(ProtocolError::SchemaMismatch {
                local: self.node.schema_version(),
                peer: schema_version,
            }
            .into());
        }

        self.report.peer = node_id;
        if self.report.role == Role::Responder {
            self.report.session_id = session_id;
        }
        Ok(clock)
    }

    /// Decide what to ask the peer for.
    async fn plan(&mut self, local: &VectorSummary, remote: &VectorSummary) -> Result<VectorSummary> {
        let cursor = db::load_cursor(self.node.pool(), &self.report.peer).await?;
        if cursor.is_some_and(|c| c.still_settled(local, remote)) {
            tracing::debug!(
                session_id = %self.report.session_id,
                peer = %self.report.peer,
                "nothing changed since the last settled exchange"
            );
            self.report.fast_path = true;
            return Ok(VectorSummary::new());
        }
        Ok(self.node.plan_requests(remote).await)
    }

    async fn send_delta(&mut self, requested: &VectorSummary) -> Result<()> {
        let operations = self.node.delta_for(requested).await;
        self.report.sent += operations.len();
        for batch in into_batches(operations, self.node.config().batch_size) {
            self.send(&batch).await?;
        }
        Ok(())
    }

    async fn receive_delta(&mut self) -> Result<()> {
        let mut expected = 0u32;
        loop {
            let (sequence, operations, last) = match self.receive().await? {
                SyncMessage::DeltaBatch {
                    sequence,
                    operations,
                    last,
                } => (sequence, operations, last),
                other => return Err(unexpected("delta_batch", &other)),
            };

            if sequence != expected {
                tracing::debug!(
                    session_id = %self.report.session_id,
                    sequence,
                    expected,
                    "delta batch out of sequence"
                );
            }
            expected = sequence.saturating_add(1);

            let outcome = self.node.merge_remote_batch(operations).await?;
            self.report.record(&outcome);
            if last {
                return Ok(());
            }
        }
    }

    /// Exchange acks and persist the cursor.
    ///
    /// The responder stores its cursor and leaves the session before sending
    /// its own ack, so once the initiator has that ack the peer is free for
    /// the next session.
    async fn acknowledge(&mut self) -> Result<()> {
        let local = self.node.version_summary().await;
        let ack = SyncMessage::Ack {
            entities: local.clone(),
        };

        match self.report.role {
            Role::Initiator => {
                self.send(&ack).await?;
                let remote = self.receive_ack().await?;
                self.store_cursor(local, remote).await?;
                self.finish();
            }
            Role::Responder => {
                let remote = self.receive_ack().await?;
                self.store_cursor(local, remote).await?;
                self.finish();
                self.send(&ack).await?;
            }
        }
        Ok(())
    }

    async fn receive_ack(&mut self) -> Result<VectorSummary> {
        match self.receive().await? {
            SyncMessage::Ack { entities } => Ok(entities),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn store_cursor(&self, local: VectorSummary, remote: VectorSummary) -> Result<()> {
        let cursor = SyncCursor {
            peer_id: self.report.peer.clone(),
            session_id: self.report.session_id.clone(),
            local,
            remote,
            updated_at: Utc::now(),
        };
        db::store_cursor(self.node.pool(), &cursor).await?;
        Ok(())
    }

    fn finish(&mut self) {
        self.transition(SessionState::Idle);
        self.guard = None;
        tracing::info!(
            node_id = %self.node.node_id(),
            peer = %self.report.peer,
            session_id = %self.report.session_id,
            sent = self.report.sent,
            applied = self.report.applied,
            rejected = self.report.rejected,
            malformed = self.report.malformed,
            fast_path = self.report.fast_path,
            "sync session finished"
        );
    }

    async fn abort(&mut self, error: &NodeError) {
        if !self.state.is_terminal() {
            self.transition(SessionState::Aborted);
        }
        self.guard = None;
        tracing::info!(
            node_id = %self.node.node_id(),
            peer = %self.report.peer,
            session_id = %self.report.session_id,
            applied = self.report.applied,
            rejected = self.report.rejected,
            error = %error,
            "sync session aborted"
        );

        // the peer already knows, or cannot be told
        if matches!(error, NodeError::Aborted(_) | NodeError::Transport(_)) {
            return;
        }
        let notice = SyncMessage::Abort {
            reason: error.to_string(),
        };
        if let Ok(frame) = notice.encode() {
            let _ = tokio::time::timeout(ABORT_SEND_TIMEOUT, self.conn.send(frame)).await;
        }
    }

    async fn exchange(&mut self, msg: SyncMessage) -> Result<SyncMessage> {
        match self.report.role {
            Role::Initiator => {
                self.send(&msg).await?;
                self.receive().await
            }
            Role::Responder => {
                let reply = self.receive().await?;
                self.send(&msg).await?;
                Ok(reply)
            }
        }
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<()> {
        tracing::trace!(session_id = %self.report.session_id, kind = msg.kind(), "send");
        let frame = msg.encode()?;
        self.conn.send(frame).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<SyncMessage> {
        let frame = match tokio::time::timeout(self.node.config().timeout, self.conn.receive()).await
        {
            Ok(frame) => frame?,
            Err(_) => return Err(NodeError::Timeout(self.state)),
        };
        match SyncMessage::decode(&frame)? {
            SyncMessage::Abort { reason } => Err(NodeError::Aborted(reason)),
            msg => {
                tracing::trace!(session_id = %self.report.session_id, kind = msg.kind(), "receive");
                Ok(msg)
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(
            session_id = %self.report.session_id,
            peer = %self.report.peer,
            from = %self.state,
            to = %next,
            "session state transition"
        );
        self.state = next;
        if let Some(guard) = &self.guard {
            guard.set_state(next);
        }
    }
}

fn unexpected(expected: &'static str, got: &SyncMessage) -> NodeError {
    ProtocolError::Unexpected {
        expected,
        got: got.kind(),
    }
    .into()
}
