//! Hybrid logical clock for causal ordering of field writes.
//!
//! A timestamp combines wall-clock milliseconds with a logical counter and the
//! issuing node id. The triple is totally ordered, and a node's readings are
//! strictly increasing even when its wall clock stalls or moves backwards.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default skew threshold before a remote reading is reported as an anomaly.
pub const DEFAULT_MAX_DRIFT_MS: u64 = 60_000;

/// A single hybrid logical clock reading.
///
/// Ordering rules:
/// 1. Higher physical time wins
/// 2. If physical times are equal, higher logical counter wins
/// 3. If both are equal, lexicographically higher node_id wins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlcTimestamp {
    /// Wall-clock component, milliseconds since the Unix epoch
    pub physical_time: u64,
    /// Tie-breaker for readings within the same millisecond
    pub logical_counter: u32,
    /// Node that produced this reading
    pub node_id: NodeId,
}

impl HlcTimestamp {
    pub fn new(physical_time: u64, logical_counter: u32, node_id: impl Into<NodeId>) -> Self {
        Self {
            physical_time,
            logical_counter,
            node_id: node_id.into(),
        }
    }

    /// The earliest possible reading for a node.
    pub fn zero(node_id: impl Into<NodeId>) -> Self {
        Self::new(0, 0, node_id)
    }

    /// Stable textual key, unique across all nodes.
    pub fn key(&self) -> String {
        format!(
            "{}.{}.{}",
            self.node_id, self.physical_time, self.logical_counter
        )
    }

    fn pair(&self) -> (u64, u32) {
        (self.physical_time, self.logical_counter)
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.pair().cmp(&other.pair()) {
            Ordering::Equal => self.node_id.cmp(&other.node_id),
            other => other,
        }
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}+{}@{}",
            self.physical_time, self.logical_counter, self.node_id
        )
    }
}

/// Source of wall-clock time for a [`HybridClock`].
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Reads the operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually driven time source, shared between clones.
#[derive(Debug, Default, Clone)]
pub struct ManualTimeSource {
    now: Arc<AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now.load(AtomicOrdering::SeqCst)
    }
}

/// Per-node hybrid logical clock.
#[derive(Debug, Clone)]
pub struct HybridClock {
    node_id: NodeId,
    last_physical: u64,
    last_logical: u32,
    max_drift_ms: u64,
    source: Arc<dyn TimeSource>,
}

impl HybridClock {
    /// Create a clock reading the system wall clock.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::with_source(node_id, Arc::new(SystemTimeSource))
    }

    /// Create a clock reading from a custom time source.
    pub fn with_source(node_id: impl Into<NodeId>, source: Arc<dyn TimeSource>) -> Self {
        Self {
            node_id: node_id.into(),
            last_physical: 0,
            last_logical: 0,
            max_drift_ms: DEFAULT_MAX_DRIFT_MS,
            source,
        }
    }

    /// Builder-style method to set the anomaly threshold.
    pub fn with_max_drift(mut self, max_drift_ms: u64) -> Self {
        self.max_drift_ms = max_drift_ms;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The most recent reading, without advancing the clock.
    pub fn last(&self) -> HlcTimestamp {
        HlcTimestamp::new(self.last_physical, self.last_logical, self.node_id.clone())
    }

    /// The reading [`HybridClock::now`] would return, without advancing the clock.
    ///
    /// Paired with [`HybridClock::commit`] so a write can be stamped before it
    /// is known to be durable.
    pub fn peek(&self) -> HlcTimestamp {
        let wall = self.source.now_ms();
        if wall > self.last_physical {
            return HlcTimestamp::new(wall, 0, self.node_id.clone());
        }

        if wall.saturating_add(self.max_drift_ms) < self.last_physical {
            tracing::warn!(
                node_id = %self.node_id,
                wall,
                last_physical = self.last_physical,
                "wall clock is behind the hybrid clock beyond the drift bound"
            );
        }
        let (physical, logical) = successor(self.last_physical, self.last_logical);
        HlcTimestamp::new(physical, logical, self.node_id.clone())
    }

    /// Adopt a reading produced by [`HybridClock::peek`].
    ///
    /// Readings older than the current state are ignored.
    pub fn commit(&mut self, ts: &HlcTimestamp) {
        if ts.pair() > (self.last_physical, self.last_logical) {
            self.last_physical = ts.physical_time;
            self.last_logical = ts.logical_counter;
        }
    }

    /// Return a reading strictly greater than every reading returned before.
    pub fn now(&mut self) -> HlcTimestamp {
        let ts = self.peek();
        self.commit(&ts);
        ts
    }

    /// Fold a remote reading into local time and return the new local reading.
    ///
    /// Never rejects a remote timestamp. Readings further than the drift bound
    /// from the local wall clock, either way, are logged as anomalies and
    /// still accepted.
    pub fn receive(&mut self, remote: &HlcTimestamp) -> HlcTimestamp {
        let wall = self.source.now_ms();
        if remote.physical_time > wall.saturating_add(self.max_drift_ms) {
            tracing::warn!(
                node_id = %self.node_id,
                remote = %remote,
                wall,
                skew_ms = remote.physical_time - wall,
                "remote clock reading is ahead of local wall time beyond the drift bound"
            );
        } else if remote.physical_time.saturating_add(self.max_drift_ms) < wall {
            tracing::warn!(
                node_id = %self.node_id,
                remote = %remote,
                wall,
                skew_ms = wall - remote.physical_time,
                "remote clock reading is behind local wall time beyond the drift bound"
            );
        }

        let physical = wall.max(self.last_physical).max(remote.physical_time);
        let (physical, logical) = if physical == self.last_physical && physical == remote.physical_time {
            successor(physical, self.last_logical.max(remote.logical_counter))
        } else if physical == remote.physical_time {
            successor(physical, remote.logical_counter)
        } else if physical == self.last_physical {
            successor(physical, self.last_logical)
        } else {
            (physical, 0)
        };

        self.last_physical = physical;
        self.last_logical = logical;
        self.last()
    }

    /// Raise the clock so it is at least as recent as `ts`.
    ///
    /// Used when restoring persisted state.
    pub fn restore(&mut self, ts: &HlcTimestamp) {
        self.commit(ts);
    }
}

/// The next reading after `(physical, logical)`. An exhausted logical
/// counter carries into physical time.
fn successor(physical: u64, logical: u32) -> (u64, u32) {
    match logical.checked_add(1) {
        Some(next) => (physical, next),
        None => (physical.saturating_add(1), 0),
    }
}
