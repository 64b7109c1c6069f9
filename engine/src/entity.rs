//! Entity types: one business object as a bundle of CRDT fields.

use crate::{
    error::Result, EntityId, EntityType, Error, FieldName, FieldState, HlcTimestamp, LwwRegister,
    OrSet, VersionVector,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A business object (employee, leave request, invoice, ...).
///
/// Entities are never physically removed. Deletion sets the tombstone, which
/// wins once observed and is kept so peers that missed it still learn of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique identifier
    pub id: EntityId,
    /// Type name, as declared in the schema
    pub entity_type: EntityType,
    /// Field states by name
    pub fields: BTreeMap<FieldName, FieldState>,
    /// Causal history of this entity
    pub version: VersionVector,
    /// Soft delete flag
    pub tombstone: bool,
    /// Earliest observed deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<HlcTimestamp>,
    /// Earliest write observed for this entity
    pub created_at: HlcTimestamp,
    /// Latest write observed for this entity
    pub updated_at: HlcTimestamp,
}

impl Entity {
    /// Create an empty entity first observed at `timestamp`.
    pub fn new(
        id: impl Into<EntityId>,
        entity_type: impl Into<EntityType>,
        timestamp: HlcTimestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields: BTreeMap::new(),
            version: VersionVector::new(),
            tombstone: false,
            deleted_at: None,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        }
    }

    /// Check if entity is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.tombstone
    }

    /// Visible value of a scalar field.
    pub fn value(&self, field: &str) -> Option<&serde_json::Value> {
        match self.fields.get(field)? {
            FieldState::Register(reg) => Some(&reg.value),
            FieldState::Set(_) => None,
        }
    }

    /// Present elements of a set field.
    pub fn set_elements(&self, field: &str) -> Option<Vec<&str>> {
        match self.fields.get(field)? {
            FieldState::Set(set) => Some(set.elements()),
            FieldState::Register(_) => None,
        }
    }

    /// Timestamp of the last write to a field.
    pub fn field_timestamp(&self, field: &str) -> Option<&HlcTimestamp> {
        self.fields.get(field).and_then(FieldState::latest)
    }

    /// Visible state as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, state)| (name.clone(), state.to_json()))
                .collect(),
        )
    }

    /// Fold a timestamp into the created/updated bounds.
    pub fn observe(&mut self, ts: &HlcTimestamp) {
        if *ts < self.created_at {
            self.created_at = ts.clone();
        }
        if *ts > self.updated_at {
            self.updated_at = ts.clone();
        }
    }

    /// Install a scalar write if it dominates the field's current timestamp.
    ///
    /// Returns whether the visible state changed.
    pub fn apply_write(
        &mut self,
        field: &str,
        value: serde_json::Value,
        ts: &HlcTimestamp,
    ) -> Result<bool> {
        match self.fields.get_mut(field) {
            Some(FieldState::Register(reg)) => Ok(reg.apply(value, ts.clone())),
            Some(FieldState::Set(_)) => Err(kind_mismatch(field, "Set", "scalar")),
            None => {
                self.fields.insert(
                    field.to_string(),
                    FieldState::Register(LwwRegister::new(value, ts.clone())),
                );
                Ok(true)
            }
        }
    }

    /// Record an add or remove of a set element.
    pub fn apply_set_delta(
        &mut self,
        field: &str,
        element: &str,
        ts: &HlcTimestamp,
        add: bool,
    ) -> Result<bool> {
        let state = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldState::Set(OrSet::new()));
        match state {
            FieldState::Set(set) => Ok(if add {
                set.add(element, ts.clone())
            } else {
                set.remove(element, ts.clone())
            }),
            FieldState::Register(_) => Err(kind_mismatch(field, "scalar", "Set")),
        }
    }

    /// Check that a write of the given kind would not hit a field of the other kind.
    pub fn check_kind(&self, field: &str, set: bool) -> Result<()> {
        match (self.fields.get(field), set) {
            (Some(FieldState::Register(_)), true) => Err(kind_mismatch(field, "scalar", "Set")),
            (Some(FieldState::Set(_)), false) => Err(kind_mismatch(field, "Set", "scalar")),
            _ => Ok(()),
        }
    }

    /// Set the tombstone. Returns whether the state changed.
    pub fn mark_deleted(&mut self, ts: &HlcTimestamp) -> bool {
        let earlier = self.deleted_at.as_ref().map_or(true, |at| ts < at);
        if earlier {
            self.deleted_at = Some(ts.clone());
        }
        let changed = !self.tombstone || earlier;
        self.tombstone = true;
        changed
    }
}

fn kind_mismatch(field: &str, expected: &str, got: &str) -> Error {
    Error::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        got: got.to_string(),
    }
}
