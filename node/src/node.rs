//! The sync node: a replica with durable storage and peers.
//!
//! All access to the replica goes through one async mutex. A local write is
//! staged, persisted and committed while holding it, so a failed database
//! write leaves the clock and version vectors where they were. Incoming
//! batches are persisted before they are merged.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tandem_engine::{
    BatchOutcome, Entity, HlcTimestamp, LocalWrite, NodeId, Operation, RejectReason, Replica,
    ReplicaSnapshot, SchemaVersion, VectorSummary, VersionVector,
};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::config::SessionConfig;
use crate::db::{self, Pool, SyncCursor};
use crate::error::{NodeError, Result};
use crate::session::{Role, SessionInfo, SessionManager, SessionReport, SyncSession};
use crate::transport::{Connection, Incoming, PeerHandle, PeerTransport};

/// Point-in-time view of a node, as served on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub clock: HlcTimestamp,
    pub schema_version: SchemaVersion,
    pub entity_count: usize,
    pub active_entity_count: usize,
    pub operation_count: usize,
    pub sessions: Vec<SessionInfo>,
    pub cursors: Vec<SyncCursor>,
}

/// A replica bound to a database and a transport.
pub struct SyncNode {
    node_id: NodeId,
    schema_version: SchemaVersion,
    replica: Mutex<Replica>,
    pool: Pool,
    transport: Arc<dyn PeerTransport>,
    sessions: Arc<SessionManager>,
    config: SessionConfig,
}

impl SyncNode {
    /// Restore `replica` from the database and bind it to `transport`.
    ///
    /// The database must already be migrated.
    pub async fn open(
        mut replica: Replica,
        pool: Pool,
        transport: Arc<dyn PeerTransport>,
        config: SessionConfig,
    ) -> Result<Self> {
        restore(&mut replica, &pool).await?;

        let node = Self {
            node_id: replica.node_id().clone(),
            schema_version: replica.schema().version,
            replica: Mutex::new(replica),
            pool,
            transport,
            sessions: SessionManager::new_shared(),
            config,
        };
        Ok(node)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // Domain API

    pub async fn create_entity(
        &self,
        entity_type: &str,
        initial: &serde_json::Value,
    ) -> Result<Entity> {
        let mut replica = self.replica.lock().await;
        let write = replica.stage_create(entity_type, initial)?;
        self.persist_and_commit(&mut replica, write).await
    }

    pub async fn update_field(
        &self,
        entity_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Entity> {
        let mut replica = self.replica.lock().await;
        let write = replica.stage_update(entity_id, field, value)?;
        self.persist_and_commit(&mut replica, write).await
    }

    pub async fn add_to_set(&self, entity_id: &str, field: &str, element: &str) -> Result<Entity> {
        let mut replica = self.replica.lock().await;
        let write = replica.stage_set_add(entity_id, field, element)?;
        self.persist_and_commit(&mut replica, write).await
    }

    pub async fn remove_from_set(
        &self,
        entity_id: &str,
        field: &str,
        element: &str,
    ) -> Result<Entity> {
        let mut replica = self.replica.lock().await;
        let write = replica.stage_set_remove(entity_id, field, element)?;
        self.persist_and_commit(&mut replica, write).await
    }

    pub async fn delete_entity(&self, entity_id: &str) -> Result<Entity> {
        let mut replica = self.replica.lock().await;
        let write = replica.stage_delete(entity_id)?;
        self.persist_and_commit(&mut replica, write).await
    }

    /// Get an active entity.
    pub async fn get_entity(&self, entity_id: &str) -> Option<Entity> {
        self.replica.lock().await.get_entity(entity_id).cloned()
    }

    /// Get an entity including tombstoned ones.
    pub async fn get_entity_including_deleted(&self, entity_id: &str) -> Option<Entity> {
        self.replica
            .lock()
            .await
            .get_entity_including_deleted(entity_id)
            .cloned()
    }

    /// Active entities of one type matching a predicate.
    pub async fn query_entities<F>(&self, entity_type: &str, predicate: F) -> Result<Vec<Entity>>
    where
        F: Fn(&Entity) -> bool,
    {
        let replica = self.replica.lock().await;
        let found = replica.query_entities(entity_type, predicate)?;
        Ok(found.into_iter().cloned().collect())
    }

    async fn persist_and_commit(&self, replica: &mut Replica, write: LocalWrite) -> Result<Entity> {
        let preview = replica.preview(&write)?;
        db::record_local_write(&self.pool, write.operation(), &preview).await?;

        let op_id = write.operation().op_id.clone();
        let entity = replica.commit(write)?;
        tracing::debug!(
            node_id = %self.node_id,
            op_id = %op_id,
            entity_id = %entity.id,
            "local write committed"
        );
        Ok(entity)
    }

    // Sync primitives

    /// Latest clock reading.
    pub async fn clock(&self) -> HlcTimestamp {
        self.replica.lock().await.now()
    }

    /// Fold a peer's clock reading into local time.
    pub async fn receive_clock(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        self.replica.lock().await.receive_clock(remote)
    }

    pub async fn version_summary(&self) -> VectorSummary {
        self.replica.lock().await.version_summary()
    }

    pub async fn version_of(&self, entity_id: &str) -> VersionVector {
        self.replica.lock().await.version_of(entity_id)
    }

    pub async fn operations_since(&self, entity_id: &str, since: &VersionVector) -> Vec<Operation> {
        self.replica.lock().await.operations_since(entity_id, since)
    }

    pub async fn plan_requests(&self, peer: &VectorSummary) -> VectorSummary {
        self.replica.lock().await.plan_requests(peer)
    }

    pub async fn delta_for(&self, requests: &VectorSummary) -> Vec<Operation> {
        self.replica.lock().await.delta_for(requests)
    }

    /// Persist and merge operations received from a peer.
    ///
    /// Only operations the merge will keep are written. Fails only if the
    /// database does; malformed operations are counted in the outcome.
    pub async fn merge_remote_batch(&self, ops: Vec<Operation>) -> Result<BatchOutcome> {
        let mut replica = self.replica.lock().await;
        let fresh = replica.admissible(&ops);
        db::record_operations(&self.pool, &fresh).await?;

        let outcome = replica.merge_batch(ops);
        if !fresh.is_empty() {
            let touched: Vec<&Entity> = outcome
                .entity_ids()
                .filter_map(|id| replica.get_entity_including_deleted(id))
                .collect();
            db::record_entities(&self.pool, touched).await?;
        }

        for summary in &outcome.summaries {
            let superseded = summary
                .rejected
                .iter()
                .filter(|r| r.reason == RejectReason::Superseded)
                .count();
            if superseded > 0 {
                tracing::debug!(
                    node_id = %self.node_id,
                    entity_id = %summary.entity_id,
                    superseded,
                    "concurrent writes resolved in favour of later timestamps"
                );
            }
        }
        Ok(outcome)
    }

    // Sessions

    /// Sync with one peer, retrying transient failures with exponential
    /// backoff.
    pub async fn sync_with_peer(&self, peer: &PeerHandle) -> Result<SessionReport> {
        let mut attempt = 0;
        loop {
            match self.try_sync(peer).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    let delay = self.config.backoff(attempt);
                    tracing::warn!(
                        node_id = %self.node_id,
                        peer = %peer.node_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "sync failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_sync(&self, peer: &PeerHandle) -> Result<SessionReport> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let guard = self
            .sessions
            .begin(&peer.node_id, Role::Initiator, &session_id)?;
        let conn = self.transport.connect(peer).await?;
        SyncSession::initiator(self, conn, peer, guard, session_id)
            .run()
            .await
    }

    /// Run the responder side of a session a peer opened.
    pub async fn accept(&self, conn: Box<dyn Connection>) -> Result<SessionReport> {
        SyncSession::responder(self, conn).run().await
    }

    /// Serve inbound connections until the transport stops delivering them.
    pub async fn serve(self: Arc<Self>, mut incoming: Incoming) {
        while let Some(conn) = incoming.recv().await {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                let remote = conn.remote().to_string();
                if let Err(e) = node.accept(conn).await {
                    tracing::debug!(%remote, error = %e, "inbound session failed");
                }
            });
        }
        tracing::debug!(node_id = %self.node_id, "inbound connections closed");
    }

    /// Discover peers and sync with each of them concurrently.
    pub async fn sync_all(self: &Arc<Self>) -> Result<Vec<(NodeId, Result<SessionReport>)>> {
        let peers = self.transport.discover().await?;
        let tasks: Vec<_> = peers
            .into_iter()
            .filter(|peer| peer.node_id != self.node_id)
            .map(|peer| {
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let result = node.sync_with_peer(&peer).await;
                    (peer.node_id, result)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(node_id = %self.node_id, error = %e, "sync task failed"),
            }
        }
        Ok(results)
    }

    /// Periodically sync with every discovered peer.
    ///
    /// A zero period disables the loop.
    pub async fn run_anti_entropy(self: Arc<Self>, period: Duration) {
        if period.is_zero() {
            tracing::warn!(node_id = %self.node_id, "anti-entropy disabled by a zero period");
            return;
        }
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sync_all().await {
                Ok(results) => {
                    for (peer, result) in results {
                        match result {
                            Ok(report) => tracing::debug!(
                                node_id = %self.node_id,
                                peer = %peer,
                                applied = report.applied,
                                sent = report.sent,
                                "anti-entropy round with peer done"
                            ),
                            Err(e) => tracing::warn!(
                                node_id = %self.node_id,
                                peer = %peer,
                                error = %e,
                                "anti-entropy round with peer failed"
                            ),
                        }
                    }
                }
                Err(e) => tracing::warn!(node_id = %self.node_id, error = %e, "peer discovery failed"),
            }
        }
    }

    /// Current state for the status surface.
    pub async fn status(&self) -> Result<NodeStatus> {
        let cursors = db::list_cursors(&self.pool).await?;
        let replica = self.replica.lock().await;
        let metadata = replica.snapshot_metadata();
        Ok(NodeStatus {
            node_id: self.node_id.clone(),
            clock: metadata.clock,
            schema_version: metadata.schema_version,
            entity_count: metadata.entity_count,
            active_entity_count: replica.entities().filter(|e| e.is_active()).count(),
            operation_count: metadata.operation_count,
            sessions: self.sessions.snapshot(),
            cursors,
        })
    }

    /// The persisted operations for one entity in timestamp order.
    pub async fn entity_history(&self, entity_id: &str) -> Result<Vec<Operation>> {
        let stored = db::operations_for_entity(&self.pool, entity_id).await?;
        Ok(stored.into_iter().map(|s| s.operation).collect())
    }

    /// Export the in-memory state.
    pub async fn export_state(&self) -> ReplicaSnapshot {
        self.replica.lock().await.export_state()
    }
}

/// Load stored entities and replay the stored log into `replica`.
async fn restore(replica: &mut Replica, pool: &Pool) -> Result<()> {
    let entities = db::load_entities(pool).await?;
    let operations = db::load_operations(pool).await?;
    if entities.is_empty() && operations.is_empty() {
        return Ok(());
    }

    let mut snapshot = ReplicaSnapshot::new(replica.schema().version, replica.node_id().clone());
    for entity in entities.into_values() {
        snapshot.add_entity(entity);
    }
    for stored in operations {
        snapshot.add_operation(stored.operation);
    }
    replica.import_state(snapshot).map_err(NodeError::from)?;

    tracing::info!(
        node_id = %replica.node_id(),
        entities = replica.entity_count(),
        operations = replica.log().len(),
        clock = %replica.now(),
        "restored replica from database"
    );
    Ok(())
}
