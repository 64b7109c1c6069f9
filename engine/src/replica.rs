//! Replica - the in-memory state of one node.
//!
//! The Replica owns the causal clock, the entity store and the operation log
//! of a single node. It exposes the domain API (create, update, delete, get,
//! query) and the sync primitives a session needs (summaries, deltas, merge).
//! All mutation goes through [`Merger`].

use crate::{
    error::Result,
    merge::{self, BatchOutcome, MergeSummary, Merger, RejectReason},
    snapshot::{ReplicaSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION},
    CausalOrder, Entity, EntityId, Error, HlcTimestamp, HybridClock, Mutation, NodeId, Operation,
    OperationLog, Schema, VersionVector,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Entity id to version vector, as exchanged during sync.
pub type VectorSummary = BTreeMap<EntityId, VersionVector>;

/// A local write that has been stamped and validated but not yet applied.
///
/// Produced by the `stage_*` methods and consumed by [`Replica::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalWrite {
    operation: Operation,
}

impl LocalWrite {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// The replica state of one node.
#[derive(Debug, Clone)]
pub struct Replica {
    schema: Schema,
    clock: HybridClock,
    entities: BTreeMap<EntityId, Entity>,
    log: OperationLog,
}

impl Replica {
    /// Create a replica reading the system wall clock.
    pub fn new(schema: Schema, node_id: impl Into<NodeId>) -> Self {
        Self::with_clock(schema, HybridClock::new(node_id))
    }

    /// Create a replica around an existing clock.
    pub fn with_clock(schema: Schema, clock: HybridClock) -> Self {
        Self {
            schema,
            clock,
            entities: BTreeMap::new(),
            log: OperationLog::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.clock.node_id()
    }

    pub fn clock(&self) -> &HybridClock {
        &self.clock
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    /// Latest clock reading.
    pub fn now(&self) -> HlcTimestamp {
        self.clock.last()
    }

    /// Fold a peer's clock reading into local time.
    pub fn receive_clock(&mut self, remote: &HlcTimestamp) -> HlcTimestamp {
        self.clock.receive(remote)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// All entities, tombstoned ones included.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    // Staging

    /// Stage the creation of a new entity from a JSON object of initial values.
    pub fn stage_create(
        &self,
        entity_type: &str,
        initial: &serde_json::Value,
    ) -> Result<LocalWrite> {
        let fields = self.schema.get(entity_type)?.split_initial(initial)?;
        let ts = self.clock.peek();
        let entity_id = format!("{entity_type}:{}", ts.key());
        let operation = Operation::new(
            entity_type,
            entity_id,
            Mutation::Create {
                fields: fields.values,
                sets: fields.sets,
            },
            ts,
            1,
        );
        Ok(LocalWrite { operation })
    }

    /// Stage a last-writer-wins write of a scalar field.
    pub fn stage_update(
        &self,
        entity_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<LocalWrite> {
        self.stage(
            entity_id,
            Mutation::Set {
                field: field.to_string(),
                value,
            },
        )
    }

    /// Stage adding an element to a set field.
    pub fn stage_set_add(&self, entity_id: &str, field: &str, element: &str) -> Result<LocalWrite> {
        self.stage(
            entity_id,
            Mutation::SetAdd {
                field: field.to_string(),
                element: element.to_string(),
            },
        )
    }

    /// Stage removing an element from a set field.
    pub fn stage_set_remove(
        &self,
        entity_id: &str,
        field: &str,
        element: &str,
    ) -> Result<LocalWrite> {
        self.stage(
            entity_id,
            Mutation::SetRemove {
                field: field.to_string(),
                element: element.to_string(),
            },
        )
    }

    /// Stage tombstoning an entity.
    pub fn stage_delete(&self, entity_id: &str) -> Result<LocalWrite> {
        self.stage(entity_id, Mutation::Delete)
    }

    fn stage(&self, entity_id: &str, mutation: Mutation) -> Result<LocalWrite> {
        let entity = self
            .entities
            .get(entity_id)
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))?;
        if !entity.is_active() {
            return Err(Error::OperationOnDeleted(entity_id.to_string()));
        }

        let counter = self.log.last_counter(entity_id, self.node_id()) + 1;
        let operation = Operation::new(
            entity.entity_type.clone(),
            entity_id,
            mutation,
            self.clock.peek(),
            counter,
        );
        self.schema.validate_operation(&operation)?;
        if let Some(field) = operation.field() {
            let set = !matches!(operation.mutation, Mutation::Set { .. });
            entity.check_kind(field, set)?;
        }
        Ok(LocalWrite { operation })
    }

    /// Apply a staged write.
    ///
    /// Fails with [`Error::StaleWrite`] if anything advanced the clock or
    /// the entity since the write was staged. Nothing changes in that case.
    pub fn commit(&mut self, write: LocalWrite) -> Result<Entity> {
        let op = write.operation;
        if op.timestamp <= self.clock.last()
            || self.log.contains(&op.op_id)
            || self.log.has_counter(&op.entity_id, &op.origin, op.counter)
        {
            return Err(Error::StaleWrite(op.op_id));
        }

        let entity_id = op.entity_id.clone();
        let op_id = op.op_id.clone();
        let ts = op.timestamp.clone();
        let summary =
            Merger::new(&self.schema, &mut self.log, &mut self.entities).merge_delta(&entity_id, vec![op]);
        if let Some(rejected) = summary.rejected.first() {
            match &rejected.reason {
                RejectReason::Duplicate => return Err(Error::StaleWrite(op_id)),
                RejectReason::Malformed(reason) => return Err(Error::InvalidPayload(reason.clone())),
                RejectReason::Superseded => {}
            }
        }
        self.clock.commit(&ts);

        tracing::trace!(op_id = %op_id, entity_id = %entity_id, "committed local write");
        self.entities
            .get(&entity_id)
            .cloned()
            .ok_or(Error::EntityNotFound(entity_id))
    }

    /// The entity as it would look after committing `write`, leaving the
    /// replica untouched.
    pub fn preview(&self, write: &LocalWrite) -> Result<Entity> {
        let op = &write.operation;
        let mut entity = match self.entities.get(&op.entity_id) {
            Some(entity) => entity.clone(),
            None => Entity::new(&op.entity_id, &op.entity_type, op.timestamp.clone()),
        };
        merge::apply_operation(&mut entity, op)?;
        if entity.version.get(&op.origin) + 1 == op.counter {
            entity.version.advance_to(&op.origin, op.counter);
        }
        Ok(entity)
    }

    // Domain API

    pub fn create_entity(&mut self, entity_type: &str, initial: &serde_json::Value) -> Result<Entity> {
        let write = self.stage_create(entity_type, initial)?;
        self.commit(write)
    }

    pub fn update_field(
        &mut self,
        entity_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Entity> {
        let write = self.stage_update(entity_id, field, value)?;
        self.commit(write)
    }

    pub fn add_to_set(&mut self, entity_id: &str, field: &str, element: &str) -> Result<Entity> {
        let write = self.stage_set_add(entity_id, field, element)?;
        self.commit(write)
    }

    pub fn remove_from_set(&mut self, entity_id: &str, field: &str, element: &str) -> Result<Entity> {
        let write = self.stage_set_remove(entity_id, field, element)?;
        self.commit(write)
    }

    pub fn delete_entity(&mut self, entity_id: &str) -> Result<Entity> {
        let write = self.stage_delete(entity_id)?;
        self.commit(write)
    }

    /// Get an active entity.
    pub fn get_entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.get(entity_id).filter(|e| e.is_active())
    }

    /// Get an entity including tombstoned ones.
    pub fn get_entity_including_deleted(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.get(entity_id)
    }

    /// Query entities of one type.
    pub fn query(&self, entity_type: &str) -> Result<QueryBuilder<'_>> {
        self.schema.get(entity_type)?;
        Ok(QueryBuilder::new(&self.entities, entity_type))
    }

    /// Active entities of one type matching a predicate.
    pub fn query_entities<F>(&self, entity_type: &str, predicate: F) -> Result<Vec<&Entity>>
    where
        F: Fn(&Entity) -> bool,
    {
        Ok(self.query(entity_type)?.filter(predicate))
    }

    // Sync support

    /// Every known entity with its version vector.
    pub fn version_summary(&self) -> VectorSummary {
        self.entities
            .iter()
            .map(|(id, entity)| (id.clone(), entity.version.clone()))
            .collect()
    }

    /// Version vector of one entity, empty if unknown.
    pub fn version_of(&self, entity_id: &str) -> VersionVector {
        self.entities
            .get(entity_id)
            .map(|e| e.version.clone())
            .unwrap_or_default()
    }

    pub fn operations_since(&self, entity_id: &str, since: &VersionVector) -> Vec<Operation> {
        self.log.operations_since(entity_id, since)
    }

    /// Entities where the peer knows something this replica does not,
    /// each paired with the local vector to request from.
    pub fn plan_requests(&self, peer: &VectorSummary) -> VectorSummary {
        peer.iter()
            .filter_map(|(entity_id, theirs)| {
                let ours = self.version_of(entity_id);
                match theirs.compare(&ours) {
                    CausalOrder::After | CausalOrder::Concurrent => Some((entity_id.clone(), ours)),
                    CausalOrder::Before | CausalOrder::Equal => None,
                }
            })
            .collect()
    }

    /// Operations answering a delta request, grouped by entity in id order.
    pub fn delta_for(&self, requests: &VectorSummary) -> Vec<Operation> {
        requests
            .iter()
            .flat_map(|(entity_id, since)| self.log.operations_since(entity_id, since))
            .collect()
    }

    /// Operations that would enter the log if merged, without merging them.
    ///
    /// Lets the caller persist exactly what the merge will keep.
    pub fn admissible(&self, ops: &[Operation]) -> Vec<Operation> {
        self.screened(ops).cloned().collect()
    }

    /// The operations of `ops` a merge would admit, in order.
    ///
    /// An entity first seen in this batch takes the type of its first
    /// admitted operation.
    fn screened<'a>(&'a self, ops: &'a [Operation]) -> impl Iterator<Item = &'a Operation> + 'a {
        let mut seen_ids: HashSet<&'a str> = HashSet::new();
        let mut seen_counters: HashSet<(&'a str, &'a str, u64)> = HashSet::new();
        let mut batch_types: HashMap<&'a str, &'a str> = HashMap::new();
        ops.iter().filter(move |op| {
            let op: &'a Operation = *op;
            if merge::screen(&self.schema, &self.log, &self.entities, &op.entity_id, op).is_err() {
                return false;
            }
            let counter = (op.entity_id.as_str(), op.origin.as_str(), op.counter);
            if seen_ids.contains(op.op_id.as_str()) || seen_counters.contains(&counter) {
                return false;
            }
            let entity_type = *batch_types
                .entry(op.entity_id.as_str())
                .or_insert(op.entity_type.as_str());
            if entity_type != op.entity_type {
                return false;
            }
            seen_ids.insert(op.op_id.as_str());
            seen_counters.insert(counter);
            true
        })
    }

    /// Merge a remote delta for one entity.
    ///
    /// Returns the updated entity, if it exists after the merge, and the
    /// applied/rejected summary.
    pub fn merge_incoming_delta(
        &mut self,
        entity_id: &str,
        ops: Vec<Operation>,
    ) -> (Option<Entity>, MergeSummary) {
        self.observe_remote(&ops);
        let summary = Merger::new(&self.schema, &mut self.log, &mut self.entities)
            .merge_delta(entity_id, ops);
        (self.entities.get(entity_id).cloned(), summary)
    }

    /// Merge a remote batch spanning several entities.
    pub fn merge_batch(&mut self, ops: Vec<Operation>) -> BatchOutcome {
        self.observe_remote(&ops);
        Merger::new(&self.schema, &mut self.log, &mut self.entities).merge_batch(ops)
    }

    fn observe_remote(&mut self, ops: &[Operation]) {
        let latest = self.screened(ops).map(|op| &op.timestamp).max().cloned();
        if let Some(ts) = latest {
            self.clock.receive(&ts);
        }
    }

    // Persistence

    /// Export the current state as a snapshot.
    pub fn export_state(&self) -> ReplicaSnapshot {
        let mut snapshot = ReplicaSnapshot::new(self.schema.version, self.node_id().clone());
        snapshot.clock = self.clock.last();
        for entity in self.entities.values() {
            snapshot.add_entity(entity.clone());
        }
        for op in self.log.iter() {
            snapshot.add_operation(op.clone());
        }
        snapshot
    }

    /// Replace the current state with a snapshot.
    ///
    /// The snapshot's log is replayed over its entities, so a snapshot whose
    /// entities lag behind its log still restores the full state. Version
    /// vectors are re-derived from the log.
    pub fn import_state(&mut self, snapshot: ReplicaSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;

        if &snapshot.node_id != self.node_id() {
            return Err(Error::InvalidSnapshot(format!(
                "node ID mismatch: expected '{}', got '{}'",
                self.node_id(),
                snapshot.node_id
            )));
        }

        let mut entities = snapshot.entities;
        let mut log = OperationLog::new();
        for op in snapshot.operations {
            if log.contains(&op.op_id) || log.has_counter(&op.entity_id, &op.origin, op.counter) {
                continue;
            }
            let entity = entities
                .entry(op.entity_id.clone())
                .or_insert_with(|| Entity::new(&op.entity_id, &op.entity_type, op.timestamp.clone()));
            if let Err(e) = merge::apply_operation(entity, &op) {
                tracing::warn!(op_id = %op.op_id, error = %e, "skipping unreplayable operation");
                continue;
            }
            log.append(op);
        }
        for entity in entities.values_mut() {
            entity.version = log.version_of(&entity.id);
        }

        self.clock.restore(&snapshot.clock);
        if let Some(latest) = log.max_timestamp() {
            self.clock.restore(latest);
        }
        self.entities = entities;
        self.log = log;

        tracing::debug!(
            node_id = %self.node_id(),
            entities = self.entities.len(),
            operations = self.log.len(),
            "imported replica state"
        );
        Ok(())
    }

    /// Get snapshot metadata without a full export.
    pub fn snapshot_metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: self.schema.version,
            node_id: self.node_id().clone(),
            clock: self.clock.last(),
            entity_count: self.entities.len(),
            operation_count: self.log.len(),
        }
    }
}

/// Builder for querying entities of one type.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    entities: &'a BTreeMap<EntityId, Entity>,
    entity_type: String,
    include_deleted: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(entities: &'a BTreeMap<EntityId, Entity>, entity_type: &str) -> Self {
        Self {
            entities,
            entity_type: entity_type.to_string(),
            include_deleted: false,
        }
    }

    /// Include tombstoned entities in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn matching(&self) -> impl Iterator<Item = &'a Entity> + '_ {
        let entities: &'a BTreeMap<EntityId, Entity> = self.entities;
        entities
            .values()
            .filter(move |e| e.entity_type == self.entity_type)
            .filter(move |e| self.include_deleted || e.is_active())
    }

    pub fn all(self) -> Vec<&'a Entity> {
        self.matching().collect()
    }

    pub fn first(self) -> Option<&'a Entity> {
        self.matching().next()
    }

    pub fn count(self) -> usize {
        self.matching().count()
    }

    /// Filter entities by a predicate.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a Entity>
    where
        F: Fn(&Entity) -> bool,
    {
        self.matching().filter(|e| predicate(e)).collect()
    }
}
