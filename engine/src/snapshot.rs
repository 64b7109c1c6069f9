//! Snapshot types for persisting and restoring replica state.
//!
//! Snapshots are the bridge between the in-memory Replica and persistent
//! storage. They use ordered maps so serialization is deterministic.

use crate::{
    error::Result, Entity, EntityId, Error, HlcTimestamp, NodeId, Operation, Schema,
    SchemaVersion,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    /// Node ID of the replica
    pub node_id: NodeId,
    /// Last hybrid clock reading
    pub clock: HlcTimestamp,
    /// Entity states by id
    pub entities: BTreeMap<EntityId, Entity>,
    /// The operation log in append order
    pub operations: Vec<Operation>,
}

impl ReplicaSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            clock: HlcTimestamp::zero(node_id.clone()),
            node_id,
            entities: BTreeMap::new(),
            operations: Vec::new(),
        }
    }

    pub fn add_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn get_entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn add_operation(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Count active (non-deleted) entities.
    pub fn active_entity_count(&self) -> usize {
        self.entities.values().filter(|e| e.is_active()).count()
    }

    /// Validate the snapshot against a schema.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        if self.schema_version != schema.version {
            return Err(Error::SchemaVersionMismatch {
                expected: schema.version,
                actual: self.schema_version,
            });
        }

        for entity in self.entities.values() {
            schema.get(&entity.entity_type)?;
        }

        for op in &self.operations {
            schema.validate_operation(op)?;
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub node_id: NodeId,
    pub clock: HlcTimestamp,
    pub entity_count: usize,
    pub operation_count: usize,
}

impl From<&ReplicaSnapshot> for SnapshotMetadata {
    fn from(snapshot: &ReplicaSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            node_id: snapshot.node_id.clone(),
            clock: snapshot.clock.clone(),
            entity_count: snapshot.entity_count(),
            operation_count: snapshot.operations.len(),
        }
    }
}
