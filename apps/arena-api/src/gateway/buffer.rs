//! Per-battle frame buffer: a bounded, version-indexed store of recently
//! generated records answering point and range queries for reconnect replay.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{BattleSnapshot, FrameTick, KeyEvent};

use super::events::Method;

/// A versioned record retained for replay. All three kinds share one
/// monotonic version counter per battle, so they live in one buffer —
/// buffering only ticks would punch permanent holes into the version window.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FrameRecord {
    Tick(FrameTick),
    Snapshot(BattleSnapshot),
    Event(KeyEvent),
}

impl FrameRecord {
    pub fn version(&self) -> u64 {
        match self {
            FrameRecord::Tick(t) => t.version,
            FrameRecord::Snapshot(s) => s.version,
            FrameRecord::Event(e) => e.version,
        }
    }

    /// The dispatch method tag this record is delivered under.
    pub fn method_tag(&self) -> &'static str {
        match self {
            FrameRecord::Tick(_) => Method::FRAME_TICK,
            FrameRecord::Snapshot(_) => Method::BATTLE_SNAPSHOT,
            FrameRecord::Event(_) => Method::KEY_EVENT,
        }
    }
}

/// Buffer statistics for capacity tuning and introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStatistics {
    pub size: usize,
    pub min_version: Option<u64>,
    pub max_version: Option<u64>,
    /// Cumulative records added since creation (survives eviction and clear).
    pub records_added: u64,
    /// Range queries fully satisfied from the buffer.
    pub range_hits: u64,
    /// Range queries that hit a gap or the eviction window.
    pub range_misses: u64,
}

struct BufferInner {
    records: HashMap<u64, FrameRecord>,
    versions: BTreeSet<u64>,
    records_added: u64,
    range_hits: u64,
    range_misses: u64,
}

/// Bounded, version-keyed store for one battle. Thread-safe; exclusively
/// owned by that battle's scheduler entry but read concurrently by catch-up
/// requests.
pub struct FrameBuffer {
    max_size: usize,
    inner: Mutex<BufferInner>,
}

impl FrameBuffer {
    /// Create a buffer retaining at most `max_size` records.
    ///
    /// Panics if `max_size` is zero; a zero-capacity replay window is a
    /// configuration error.
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "frame buffer max_size must be > 0");
        Self {
            max_size,
            inner: Mutex::new(BufferInner {
                records: HashMap::new(),
                versions: BTreeSet::new(),
                records_added: 0,
                range_hits: 0,
                range_misses: 0,
            }),
        }
    }

    /// Insert a record keyed by its version, evicting oldest-version-first
    /// once the buffer exceeds capacity.
    pub fn add_frame(&self, record: FrameRecord) {
        let version = record.version();
        let mut inner = self.inner.lock();
        if inner.records.insert(version, record).is_none() {
            inner.versions.insert(version);
        }
        inner.records_added += 1;
        while inner.records.len() > self.max_size {
            if let Some(oldest) = inner.versions.pop_first() {
                inner.records.remove(&oldest);
            }
        }
    }

    /// Point lookup by version.
    pub fn frame(&self, version: u64) -> Option<FrameRecord> {
        self.inner.lock().records.get(&version).cloned()
    }

    pub fn has_frame(&self, version: u64) -> bool {
        self.inner.lock().records.contains_key(&version)
    }

    /// Ordered records for the inclusive range `[from, to]`, but only if
    /// every version in the range is present. Any gap (or `from > to`)
    /// yields an empty result, so a caller never assembles state from a
    /// gappy delta sequence.
    pub fn frames_in_range(&self, from: u64, to: u64) -> Vec<FrameRecord> {
        let mut inner = self.inner.lock();
        if !complete_range(&inner, from, to) {
            inner.range_misses += 1;
            return Vec::new();
        }
        inner.range_hits += 1;
        (from..=to)
            .filter_map(|v| inner.records.get(&v).cloned())
            .collect()
    }

    /// Whether every version in `[from, to]` is currently retained.
    pub fn has_complete_range(&self, from: u64, to: u64) -> bool {
        let mut inner = self.inner.lock();
        let complete = complete_range(&inner, from, to);
        if complete {
            inner.range_hits += 1;
        } else {
            inner.range_misses += 1;
        }
        complete
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn statistics(&self) -> BufferStatistics {
        let inner = self.inner.lock();
        BufferStatistics {
            size: inner.records.len(),
            min_version: inner.versions.first().copied(),
            max_version: inner.versions.last().copied(),
            records_added: inner.records_added,
            range_hits: inner.range_hits,
            range_misses: inner.range_misses,
        }
    }

    /// Empty the buffer. Used when a battle restarts frame numbering.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.versions.clear();
    }
}

fn complete_range(inner: &BufferInner, from: u64, to: u64) -> bool {
    if from > to {
        return false;
    }
    (from..=to).all(|v| inner.records.contains_key(&v))
}
