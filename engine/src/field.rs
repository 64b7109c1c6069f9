//! CRDT wrappers for individual entity attributes.
//!
//! Scalar attributes are last-writer-wins registers. Collection attributes
//! (tags, skills) are observed-remove sets with a timestamp per element.

use crate::{HlcTimestamp, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A last-writer-wins register.
///
/// The visible value is always the one carried by the greatest timestamp ever
/// applied, so applying writes is idempotent and commutative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwRegister<T> {
    pub value: T,
    pub timestamp: HlcTimestamp,
    pub writer: NodeId,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new(value: T, timestamp: HlcTimestamp) -> Self {
        let writer = timestamp.node_id.clone();
        Self {
            value,
            timestamp,
            writer,
        }
    }

    /// Install a write if its timestamp is strictly greater than the current one.
    ///
    /// Returns whether the register changed.
    pub fn apply(&mut self, value: T, timestamp: HlcTimestamp) -> bool {
        if timestamp <= self.timestamp {
            return false;
        }
        self.writer = timestamp.node_id.clone();
        self.value = value;
        self.timestamp = timestamp;
        true
    }

    pub fn merge(&self, other: &Self) -> Self {
        if other.timestamp > self.timestamp {
            other.clone()
        } else {
            self.clone()
        }
    }
}

/// An observed-remove set of string elements.
///
/// An element is present iff its latest add is later than its latest remove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSet {
    added: BTreeMap<String, HlcTimestamp>,
    removed: BTreeMap<String, HlcTimestamp>,
}

fn raise(map: &mut BTreeMap<String, HlcTimestamp>, element: &str, ts: HlcTimestamp) -> bool {
    match map.get(element) {
        Some(existing) if *existing >= ts => false,
        _ => {
            map.insert(element.to_string(), ts);
            true
        }
    }
}

fn merge_max(
    left: &BTreeMap<String, HlcTimestamp>,
    right: &BTreeMap<String, HlcTimestamp>,
) -> BTreeMap<String, HlcTimestamp> {
    let mut merged = left.clone();
    for (element, ts) in right {
        raise(&mut merged, element, ts.clone());
    }
    merged
}

impl OrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an add. Returns whether the set's state changed.
    pub fn add(&mut self, element: &str, ts: HlcTimestamp) -> bool {
        raise(&mut self.added, element, ts)
    }

    /// Record a remove. Returns whether the set's state changed.
    pub fn remove(&mut self, element: &str, ts: HlcTimestamp) -> bool {
        raise(&mut self.removed, element, ts)
    }

    pub fn contains(&self, element: &str) -> bool {
        match (self.added.get(element), self.removed.get(element)) {
            (Some(added), Some(removed)) => added > removed,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Present elements in sorted order.
    pub fn elements(&self) -> Vec<&str> {
        self.added
            .keys()
            .filter(|e| self.contains(e))
            .map(String::as_str)
            .collect()
    }

    /// Latest add or remove timestamp across all elements.
    pub fn latest(&self) -> Option<&HlcTimestamp> {
        self.added.values().chain(self.removed.values()).max()
    }

    pub fn merge(&self, other: &Self) -> Self {
        Self {
            added: merge_max(&self.added, &other.added),
            removed: merge_max(&self.removed, &other.removed),
        }
    }
}

/// State of a single attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldState {
    Register(LwwRegister<serde_json::Value>),
    Set(OrSet),
}

impl FieldState {
    /// Latest timestamp recorded in this field.
    pub fn latest(&self) -> Option<&HlcTimestamp> {
        match self {
            FieldState::Register(reg) => Some(&reg.timestamp),
            FieldState::Set(set) => set.latest(),
        }
    }

    /// Visible value as JSON. Sets render as sorted arrays.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldState::Register(reg) => reg.value.clone(),
            FieldState::Set(set) => serde_json::Value::Array(
                set.elements()
                    .into_iter()
                    .map(|e| serde_json::Value::String(e.to_string()))
                    .collect(),
            ),
        }
    }

    /// Merge two replicas of the same attribute.
    ///
    /// If the replicas disagree on the attribute's kind (only possible after a
    /// schema divergence), the side with the later write is kept and a set wins
    /// an exact tie.
    pub fn merge(&self, other: &Self) -> Self {
        match (self, other) {
            (FieldState::Register(a), FieldState::Register(b)) => FieldState::Register(a.merge(b)),
            (FieldState::Set(a), FieldState::Set(b)) => FieldState::Set(a.merge(b)),
            (FieldState::Register(reg), set @ FieldState::Set(_))
            | (set @ FieldState::Set(_), FieldState::Register(reg)) => {
                if set.latest().is_some_and(|ts| *ts >= reg.timestamp) {
                    set.clone()
                } else {
                    FieldState::Register(reg.clone())
                }
            }
        }
    }
}
