//! Merge engine: the single path through which writes reach entity state.
//!
//! Both local writes and remote deltas are folded in here. Every rule is
//! timestamp dominance or a lattice join, so the result is independent of
//! arrival order and of duplicate delivery.

use crate::{
    error::Result, Entity, EntityId, Error, Mutation, Operation, OperationId, OperationLog,
    Schema,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Why an incoming operation did not change state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// The op id is already in the log
    Duplicate,
    /// Logged, but every field it touches already carries a later write
    Superseded,
    /// Failed validation and was not logged
    Malformed(String),
}

/// An operation that did not take effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedOp {
    pub op_id: OperationId,
    pub reason: RejectReason,
}

/// Outcome of merging a delta into one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub entity_id: EntityId,
    /// Operations that changed visible state
    pub applied: Vec<OperationId>,
    /// Operations that did not
    pub rejected: Vec<RejectedOp>,
}

impl MergeSummary {
    fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            ..Default::default()
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn malformed_count(&self) -> usize {
        self.rejected
            .iter()
            .filter(|r| matches!(r.reason, RejectReason::Malformed(_)))
            .count()
    }

    fn reject(&mut self, op_id: &str, reason: RejectReason) {
        self.rejected.push(RejectedOp {
            op_id: op_id.to_string(),
            reason,
        });
    }
}

/// Outcome of merging a batch spanning several entities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub summaries: Vec<MergeSummary>,
}

impl BatchOutcome {
    pub fn applied_count(&self) -> usize {
        self.summaries.iter().map(MergeSummary::applied_count).sum()
    }

    pub fn rejected_count(&self) -> usize {
        self.summaries.iter().map(MergeSummary::rejected_count).sum()
    }

    pub fn malformed_count(&self) -> usize {
        self.summaries.iter().map(MergeSummary::malformed_count).sum()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.summaries.iter().map(|s| &s.entity_id)
    }
}

/// Apply one operation to an entity.
///
/// Returns whether the visible state changed. On error the entity is left
/// untouched.
pub fn apply_operation(entity: &mut Entity, op: &Operation) -> Result<bool> {
    if op.entity_id != entity.id {
        return Err(Error::EntityMismatch {
            expected: entity.id.clone(),
            got: op.entity_id.clone(),
        });
    }
    if op.entity_type != entity.entity_type {
        return Err(Error::EntityTypeMismatch {
            entity_id: entity.id.clone(),
            expected: entity.entity_type.clone(),
            got: op.entity_type.clone(),
        });
    }
    let ts = &op.timestamp;

    let changed = match &op.mutation {
        Mutation::Create { fields, sets } => {
            for name in fields.keys() {
                entity.check_kind(name, false)?;
            }
            for name in sets.keys() {
                entity.check_kind(name, true)?;
            }
            let mut changed = false;
            for (name, value) in fields {
                changed |= entity.apply_write(name, value.clone(), ts)?;
            }
            for (name, elements) in sets {
                for element in elements {
                    changed |= entity.apply_set_delta(name, element, ts, true)?;
                }
            }
            changed
        }
        Mutation::Set { field, value } => entity.apply_write(field, value.clone(), ts)?,
        Mutation::SetAdd { field, element } => entity.apply_set_delta(field, element, ts, true)?,
        Mutation::SetRemove { field, element } => {
            entity.apply_set_delta(field, element, ts, false)?
        }
        Mutation::Delete => entity.mark_deleted(ts),
    };

    entity.observe(ts);
    Ok(changed)
}

/// Merge two replicas of the same entity.
///
/// Fields keep the wrapper with the greater timestamp, sets are unioned,
/// version vectors are joined entry-wise and the tombstone is OR'd. The
/// result is commutative, associative and idempotent.
pub fn merge_entity(local: &Entity, remote: &Entity) -> Entity {
    let mut fields = local.fields.clone();
    for (name, theirs) in &remote.fields {
        let merged = match fields.get(name) {
            Some(ours) => ours.merge(theirs),
            None => theirs.clone(),
        };
        fields.insert(name.clone(), merged);
    }

    let deleted_at = match (&local.deleted_at, &remote.deleted_at) {
        (Some(a), Some(b)) => Some(a.min(b).clone()),
        (a, b) => a.clone().or_else(|| b.clone()),
    };

    Entity {
        id: local.id.clone(),
        entity_type: local.entity_type.clone().min(remote.entity_type.clone()),
        fields,
        version: local.version.merge(&remote.version),
        tombstone: local.tombstone || remote.tombstone,
        deleted_at,
        created_at: local.created_at.clone().min(remote.created_at.clone()),
        updated_at: local.updated_at.clone().max(remote.updated_at.clone()),
    }
}

/// Folds operations into a replica's log and entities, validating each one
/// against the schema on the way in.
pub struct Merger<'a> {
    schema: &'a Schema,
    log: &'a mut OperationLog,
    entities: &'a mut BTreeMap<EntityId, Entity>,
}

impl<'a> Merger<'a> {
    pub fn new(
        schema: &'a Schema,
        log: &'a mut OperationLog,
        entities: &'a mut BTreeMap<EntityId, Entity>,
    ) -> Self {
        Self {
            schema,
            log,
            entities,
        }
    }

    /// Merge a delta of operations targeting one entity.
    ///
    /// A malformed operation is rejected and logged without aborting the
    /// rest of the delta.
    pub fn merge_delta(&mut self, entity_id: &str, ops: Vec<Operation>) -> MergeSummary {
        let mut summary = MergeSummary::new(entity_id);

        for op in ops {
            match self.merge_one(entity_id, &op) {
                Ok(true) => summary.applied.push(op.op_id),
                Ok(false) => summary.reject(&op.op_id, RejectReason::Superseded),
                Err(RejectReason::Malformed(reason)) => {
                    tracing::warn!(
                        op_id = %op.op_id,
                        entity_id = %entity_id,
                        origin = %op.origin,
                        %reason,
                        "rejected malformed operation"
                    );
                    summary.reject(&op.op_id, RejectReason::Malformed(reason));
                }
                Err(reason) => summary.reject(&op.op_id, reason),
            }
        }

        summary
    }

    /// Merge a batch spanning several entities, grouped in first-seen order.
    pub fn merge_batch(&mut self, ops: Vec<Operation>) -> BatchOutcome {
        let mut order: Vec<EntityId> = Vec::new();
        let mut grouped: HashMap<EntityId, Vec<Operation>> = HashMap::new();
        for op in ops {
            if !grouped.contains_key(&op.entity_id) {
                order.push(op.entity_id.clone());
            }
            grouped.entry(op.entity_id.clone()).or_default().push(op);
        }

        let summaries = order
            .into_iter()
            .map(|entity_id| {
                let ops = grouped.remove(&entity_id).unwrap_or_default();
                self.merge_delta(&entity_id, ops)
            })
            .collect();
        BatchOutcome { summaries }
    }

    fn merge_one(&mut self, entity_id: &str, op: &Operation) -> std::result::Result<bool, RejectReason> {
        screen(self.schema, self.log, self.entities, entity_id, op)?;

        let changed = match self.entities.get_mut(entity_id) {
            Some(entity) => apply_operation(entity, op).map_err(malformed)?,
            None => {
                let mut entity = Entity::new(entity_id, &op.entity_type, op.timestamp.clone());
                apply_operation(&mut entity, op).map_err(malformed)?;
                self.entities.insert(entity_id.to_string(), entity);
                true
            }
        };

        self.log.append(op.clone());
        if let Some(entity) = self.entities.get_mut(entity_id) {
            let current = entity.version.get(&op.origin);
            let reached = self.log.contiguous_counter(entity_id, &op.origin, current);
            entity.version.advance_to(&op.origin, reached);
        }
        Ok(changed)
    }
}

fn malformed(e: Error) -> RejectReason {
    RejectReason::Malformed(e.to_string())
}

/// Decide whether an operation for `entity_id` may enter the log, without
/// touching any state.
///
/// Returns [`RejectReason::Duplicate`] for an op id already logged and
/// [`RejectReason::Malformed`] for anything failing validation.
pub fn screen(
    schema: &Schema,
    log: &OperationLog,
    entities: &BTreeMap<EntityId, Entity>,
    entity_id: &str,
    op: &Operation,
) -> std::result::Result<(), RejectReason> {
    if op.entity_id != entity_id {
        return Err(malformed(Error::EntityMismatch {
            expected: entity_id.to_string(),
            got: op.entity_id.clone(),
        }));
    }
    if log.contains(&op.op_id) {
        return Err(RejectReason::Duplicate);
    }
    schema.validate_operation(op).map_err(malformed)?;
    if op.counter == 0 || op.origin != op.timestamp.node_id {
        return Err(RejectReason::Malformed(format!(
            "operation {} has an invalid origin or counter",
            op.op_id
        )));
    }
    if log.has_counter(entity_id, &op.origin, op.counter) {
        return Err(RejectReason::Malformed(format!(
            "counter {} of {} already used for entity {entity_id}",
            op.counter, op.origin
        )));
    }

    if let Some(entity) = entities.get(entity_id) {
        if entity.entity_type != op.entity_type {
            return Err(malformed(Error::EntityTypeMismatch {
                entity_id: entity_id.to_string(),
                expected: entity.entity_type.clone(),
                got: op.entity_type.clone(),
            }));
        }
        let kinds = match &op.mutation {
            Mutation::Set { field, .. } => entity.check_kind(field, false),
            Mutation::SetAdd { field, .. } | Mutation::SetRemove { field, .. } => {
                entity.check_kind(field, true)
            }
            Mutation::Create { fields, sets } => fields
                .keys()
                .try_for_each(|name| entity.check_kind(name, false))
                .and_then(|()| sets.keys().try_for_each(|name| entity.check_kind(name, true))),
            Mutation::Delete => Ok(()),
        };
        kinds.map_err(malformed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntitySchema, FieldDef, FieldType, HlcTimestamp};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new(1).with_entity_type(EntitySchema::new(
            "employee",
            vec![
                FieldDef::optional("firstName", FieldType::String),
                FieldDef::optional("jobTitle", FieldType::String),
                FieldDef::optional("skills", FieldType::Set),
            ],
        ))
    }

    fn set(node: &str, physical: u64, counter: u64, field: &str, value: &str) -> Operation {
        Operation::new(
            "employee",
            "e1",
            Mutation::Set {
                field: field.into(),
                value: json!(value),
            },
            HlcTimestamp::new(physical, 0, node),
            counter,
        )
    }

    fn merge(ops: Vec<Operation>) -> (MergeSummary, BTreeMap<EntityId, Entity>, OperationLog) {
        let schema = test_schema();
        let mut log = OperationLog::new();
        let mut entities = BTreeMap::new();
        let summary = Merger::new(&schema, &mut log, &mut entities).merge_delta("e1", ops);
        (summary, entities, log)
    }

    #[test]
    fn later_write_wins() {
        let (summary, entities, _) = merge(vec![
            set("n1", 10, 1, "firstName", "Ada"),
            set("n2", 20, 1, "firstName", "Adah"),
        ]);
        assert_eq!(summary.applied_count(), 2);
        assert_eq!(entities["e1"].value("firstName"), Some(&json!("Adah")));
    }

    #[test]
    fn stale_write_is_superseded_but_logged() {
        let (summary, entities, log) = merge(vec![
            set("n2", 20, 1, "firstName", "Adah"),
            set("n1", 10, 1, "firstName", "Ada"),
        ]);
        assert_eq!(summary.applied, vec!["op:n2.20.0".to_string()]);
        assert_eq!(summary.rejected[0].reason, RejectReason::Superseded);
        assert_eq!(log.len(), 2);
        assert_eq!(entities["e1"].version.get("n1"), 1);
    }

    #[test]
    fn duplicate_delivery_is_fully_rejected() {
        let ops = vec![
            set("n1", 10, 1, "firstName", "Ada"),
            set("n1", 11, 2, "jobTitle", "CTO"),
        ];
        let schema = test_schema();
        let mut log = OperationLog::new();
        let mut entities = BTreeMap::new();
        let mut merger = Merger::new(&schema, &mut log, &mut entities);

        let first = merger.merge_delta("e1", ops.clone());
        let second = merger.merge_delta("e1", ops);
        assert_eq!(first.applied_count(), 2);
        assert_eq!(second.applied_count(), 0);
        assert_eq!(second.rejected_count(), 2);
        assert!(second
            .rejected
            .iter()
            .all(|r| r.reason == RejectReason::Duplicate));
    }

    #[test]
    fn malformed_operation_does_not_abort_batch() {
        let (summary, entities, log) = merge(vec![
            set("n1", 10, 1, "salary", "lots"),
            set("n1", 11, 2, "firstName", "Ada"),
        ]);
        assert_eq!(summary.malformed_count(), 1);
        assert_eq!(summary.applied_count(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(entities["e1"].value("firstName"), Some(&json!("Ada")));
        // counter 1 is missing, so the vector cannot advance past the gap
        assert_eq!(entities["e1"].version.get("n1"), 0);
    }

    #[test]
    fn reused_counter_is_malformed() {
        let mut forged = set("n1", 99, 1, "jobTitle", "forged");
        forged.op_id = "forged".into();
        let (summary, _, _) = merge(vec![set("n1", 10, 1, "firstName", "Ada"), forged]);
        assert_eq!(summary.malformed_count(), 1);
    }

    #[test]
    fn foreign_entity_in_delta_is_malformed() {
        let mut op = set("n1", 10, 1, "firstName", "Ada");
        op.entity_id = "e2".into();
        let (summary, entities, _) = merge(vec![op]);
        assert_eq!(summary.malformed_count(), 1);
        assert!(entities.is_empty());
    }

    #[test]
    fn out_of_order_counters_advance_once_contiguous() {
        let (_, entities, _) = merge(vec![
            set("n1", 12, 3, "firstName", "c"),
            set("n1", 11, 2, "jobTitle", "b"),
        ]);
        assert_eq!(entities["e1"].version.get("n1"), 0);

        let (_, entities, _) = merge(vec![
            set("n1", 12, 3, "firstName", "c"),
            set("n1", 11, 2, "jobTitle", "b"),
            set("n1", 10, 1, "jobTitle", "a"),
        ]);
        assert_eq!(entities["e1"].version.get("n1"), 3);
        assert_eq!(entities["e1"].value("jobTitle"), Some(&json!("b")));
    }

    #[test]
    fn merge_batch_groups_by_entity() {
        let mut other = set("n1", 10, 1, "firstName", "Bob");
        other.entity_id = "e2".into();
        other.op_id = "other".into();

        let schema = test_schema();
        let mut log = OperationLog::new();
        let mut entities = BTreeMap::new();
        let outcome = Merger::new(&schema, &mut log, &mut entities)
            .merge_batch(vec![set("n1", 10, 1, "firstName", "Ada"), other]);

        let ids: Vec<_> = outcome.entity_ids().cloned().collect();
        assert_eq!(ids, vec!["e1".to_string(), "e2".to_string()]);
        assert_eq!(outcome.applied_count(), 2);
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn merge_entity_joins_fields_and_tombstones() {
        let ts = |p: u64, n: &str| HlcTimestamp::new(p, 0, n);
        let mut a = Entity::new("e1", "employee", ts(1, "n1"));
        a.apply_write("jobTitle", json!("CTO"), &ts(5, "n1")).unwrap();
        a.version.increment("n1");

        let mut b = Entity::new("e1", "employee", ts(1, "n1"));
        b.apply_write("department", json!("R&D"), &ts(6, "n2")).unwrap();
        b.mark_deleted(&ts(7, "n2"));
        b.version.increment("n2");

        let ab = merge_entity(&a, &b);
        assert_eq!(ab, merge_entity(&b, &a));
        assert_eq!(ab.value("jobTitle"), Some(&json!("CTO")));
        assert_eq!(ab.value("department"), Some(&json!("R&D")));
        assert!(ab.tombstone);
        assert_eq!(ab.version.get("n1"), 1);
        assert_eq!(ab.version.get("n2"), 1);
        assert_eq!(merge_entity(&ab, &ab), ab);
    }

    #[test]
    fn summary_serialization() {
        let mut summary = MergeSummary::new("e1");
        summary.reject("op-1", RejectReason::Malformed("bad".into()));
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains(r#""type":"malformed""#));
    }
}
