//! Version vectors for detecting ordered vs. concurrent entity histories.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Causal relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CausalOrder {
    /// Left happened before right
    Before,
    /// Left happened after right
    After,
    /// Identical histories
    Equal,
    /// Neither dominates the other
    Concurrent,
}

impl CausalOrder {
    /// The relationship seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        }
    }
}

/// Per-node contribution counts for one entity.
///
/// Missing entries count as zero. Entries are never stored as zero, so two
/// vectors describing the same history compare equal structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
    entries: BTreeMap<NodeId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contribution count for a node (0 if never seen).
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Bump a node's entry by one, returning the new count.
    pub fn increment(&mut self, node_id: &str) -> u64 {
        let entry = self.entries.entry(node_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Copy of this vector with a node's entry bumped by one.
    pub fn incremented(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        next.increment(node_id);
        next
    }

    /// Raise a node's entry to `count` if it is currently lower.
    pub fn advance_to(&mut self, node_id: &str, count: u64) {
        if count > self.get(node_id) {
            self.entries.insert(node_id.to_string(), count);
        }
    }

    /// Entry-wise maximum of two vectors.
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// Merge another vector into this one in place.
    pub fn merge_in(&mut self, other: &VersionVector) {
        for (node, &count) in &other.entries {
            self.advance_to(node, count);
        }
    }

    /// Compare two vectors.
    pub fn compare(&self, other: &VersionVector) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let (mine, theirs) = (self.get(node), other.get(node));
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if every entry is <= the other's and at least one is strictly less.
    pub fn happened_before(&self, other: &VersionVector) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// True if this vector has seen everything the other has.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::After | CausalOrder::Equal
        )
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all contributions.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.entries.iter().map(|(node, &count)| (node, count))
    }
}

impl FromIterator<(NodeId, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        let mut vector = VersionVector::new();
        for (node, count) in iter {
            vector.advance_to(&node, count);
        }
        vector
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node, count)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{node}:{count}")?;
        }
        write!(f, "}}")
    }
}
