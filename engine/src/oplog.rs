//! Append-only operation log.
//!
//! The log is the source of truth for what a replica has seen. Entity state
//! can always be re-derived from it, and it answers the delta question
//! "which operations does a peer with this version vector still miss?".

use crate::{merge, EntityId, Entity, NodeId, Operation, OperationId, VersionVector};
use std::collections::{BTreeMap, HashMap};

/// In-memory mirror of the persisted operation log.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    entries: Vec<Operation>,
    by_id: HashMap<OperationId, usize>,
    /// entity -> (origin, counter) -> entry index
    by_entity: HashMap<EntityId, BTreeMap<(NodeId, u64), usize>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.by_id.contains_key(op_id)
    }

    pub fn get(&self, op_id: &str) -> Option<&Operation> {
        self.by_id.get(op_id).map(|&i| &self.entries[i])
    }

    /// Append an operation. Returns false if the op id is already logged.
    ///
    /// Durability is the caller's concern: the node persists an operation
    /// before it is appended here.
    pub fn append(&mut self, op: Operation) -> bool {
        if self.by_id.contains_key(&op.op_id) {
            return false;
        }
        let index = self.entries.len();
        self.by_id.insert(op.op_id.clone(), index);
        self.by_entity
            .entry(op.entity_id.clone())
            .or_default()
            .insert((op.origin.clone(), op.counter), index);
        self.entries.push(op);
        true
    }

    /// Whether an operation with this origin counter is logged for the entity.
    pub fn has_counter(&self, entity_id: &str, origin: &str, counter: u64) -> bool {
        self.by_entity
            .get(entity_id)
            .is_some_and(|ops| ops.contains_key(&(origin.to_string(), counter)))
    }

    /// Highest counter logged for an origin on an entity, gaps included.
    pub fn last_counter(&self, entity_id: &str, origin: &str) -> u64 {
        self.by_entity
            .get(entity_id)
            .and_then(|ops| {
                ops.range((origin.to_string(), 0)..=(origin.to_string(), u64::MAX))
                    .next_back()
                    .map(|((_, counter), _)| *counter)
            })
            .unwrap_or(0)
    }

    /// Highest counter reachable from `from` without a gap.
    pub fn contiguous_counter(&self, entity_id: &str, origin: &str, from: u64) -> u64 {
        let mut counter = from;
        while self.has_counter(entity_id, origin, counter + 1) {
            counter += 1;
        }
        counter
    }

    /// Version vector implied by the contiguous runs of logged operations.
    pub fn version_of(&self, entity_id: &str) -> VersionVector {
        let Some(ops) = self.by_entity.get(entity_id) else {
            return VersionVector::new();
        };
        let mut vector = VersionVector::new();
        let mut origins: Vec<&NodeId> = ops.keys().map(|(origin, _)| origin).collect();
        origins.dedup();
        for origin in origins {
            vector.advance_to(origin, self.contiguous_counter(entity_id, origin, 0));
        }
        vector
    }

    /// Operations for an entity not yet reflected in `since`, in timestamp order.
    pub fn operations_since(&self, entity_id: &str, since: &VersionVector) -> Vec<Operation> {
        let Some(ops) = self.by_entity.get(entity_id) else {
            return Vec::new();
        };
        let mut missing: Vec<Operation> = ops
            .iter()
            .filter(|((origin, counter), _)| *counter > since.get(origin))
            .map(|(_, &i)| self.entries[i].clone())
            .collect();
        missing.sort();
        missing
    }

    /// All operations for an entity, in timestamp order.
    pub fn operations_for(&self, entity_id: &str) -> Vec<Operation> {
        self.operations_since(entity_id, &VersionVector::new())
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.by_entity.keys()
    }

    /// Operations in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    /// Greatest timestamp in the log.
    pub fn max_timestamp(&self) -> Option<&crate::HlcTimestamp> {
        self.entries.iter().map(|op| &op.timestamp).max()
    }
}

/// Re-derive entity state from a sequence of logged operations.
///
/// Replaying the same operations twice, or in any order, yields the same
/// entities: field writes are timestamp-dominated and duplicate op ids are
/// skipped. Operations are trusted to have been validated when first logged.
pub fn replay<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> BTreeMap<EntityId, Entity> {
    let mut log = OperationLog::new();
    let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();

    for op in ops {
        if log.contains(&op.op_id) || log.has_counter(&op.entity_id, &op.origin, op.counter) {
            continue;
        }
        let entity = entities
            .entry(op.entity_id.clone())
            .or_insert_with(|| Entity::new(&op.entity_id, &op.entity_type, op.timestamp.clone()));
        if let Err(e) = merge::apply_operation(entity, op) {
            tracing::warn!(op_id = %op.op_id, error = %e, "skipping unreplayable operation");
            continue;
        }
        log.append(op.clone());
    }

    for entity in entities.values_mut() {
        entity.version = log.version_of(&entity.id);
    }
    entities
}
