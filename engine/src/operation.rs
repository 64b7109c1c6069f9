//! Operation types for expressing changes.
//!
//! Every local write becomes exactly one immutable operation. Operations are
//! both the unit of the local log and the unit exchanged between peers.

use crate::{EntityId, EntityType, FieldName, HlcTimestamp, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier for an operation.
pub type OperationId = String;

/// What an operation does to its entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// Establish the entity with its initial field values.
    Create {
        fields: BTreeMap<FieldName, serde_json::Value>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        sets: BTreeMap<FieldName, BTreeSet<String>>,
    },
    /// Last-writer-wins write of a scalar field.
    Set {
        field: FieldName,
        value: serde_json::Value,
    },
    /// Add an element to a set field.
    SetAdd { field: FieldName, element: String },
    /// Remove an element from a set field.
    SetRemove { field: FieldName, element: String },
    /// Tombstone the entity.
    Delete,
}

impl Mutation {
    /// Field this mutation targets, if any.
    pub fn field(&self) -> Option<&FieldName> {
        match self {
            Mutation::Set { field, .. }
            | Mutation::SetAdd { field, .. }
            | Mutation::SetRemove { field, .. } => Some(field),
            Mutation::Create { .. } | Mutation::Delete => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create { .. } => "create",
            Mutation::Set { .. } => "set",
            Mutation::SetAdd { .. } => "set_add",
            Mutation::SetRemove { .. } => "set_remove",
            Mutation::Delete => "delete",
        }
    }
}

/// A single field-level mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation ID
    pub op_id: OperationId,
    /// Type of the target entity
    pub entity_type: EntityType,
    /// Target entity
    pub entity_id: EntityId,
    /// The change itself
    pub mutation: Mutation,
    /// Hybrid logical clock reading at write time
    pub timestamp: HlcTimestamp,
    /// Node that produced the write
    pub origin: NodeId,
    /// Origin node's version vector entry for the entity after this write
    pub counter: u64,
}

impl Operation {
    /// Create an operation. The id and origin derive from the timestamp.
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        mutation: Mutation,
        timestamp: HlcTimestamp,
        counter: u64,
    ) -> Self {
        Self {
            op_id: format!("op:{}", timestamp.key()),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            mutation,
            origin: timestamp.node_id.clone(),
            timestamp,
            counter,
        }
    }

    /// Field this operation targets, if any.
    pub fn field(&self) -> Option<&FieldName> {
        self.mutation.field()
    }
}

/// Operations are ordered by (timestamp, op_id).
impl Ord for Operation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Equal => self.op_id.cmp(&other.op_id),
            other => other,
        }
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Operation {}
