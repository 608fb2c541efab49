//! Window state, the combine operation, and per-namespace retention.
//!
//! # Combine
//!
//! [`combine`] merges two metric maps field by field using the namespace's
//! [`CombineProgram`]. A field absent on one side takes the other side's
//! value; an absent left operand is the identity. Every [`MergeOp`] is
//! commutative and associative, so contributions to a bucket converge to
//! the same state regardless of arrival order, concurrency, or replay.
//!
//! # Retention
//!
//! [`WindowRing`] is the fixed-capacity ordered structure that holds a
//! namespace's live buckets:
//! - Keyed by `bucket_start = floor(t, granularity)`
//! - Opening a bucket beyond capacity evicts the oldest bucket
//! - Age eviction drops buckets older than a horizon
//! - Evicted cells are returned to the caller, which runs the eviction hook
//!
//! Each bucket is a [`WindowCell`] with its own lock, so merges into
//! different buckets never contend and each merge commits atomically.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::program::{CombineProgram, MergeOp};

/// Returns the start of the interval of length `granularity_ns` that
/// contains `timestamp_ns`.
///
/// ```rust
/// use tally::window::floor_to;
///
/// assert_eq!(floor_to(0, 60), 0);
/// assert_eq!(floor_to(59, 60), 0);
/// assert_eq!(floor_to(61, 60), 60);
/// ```
#[inline]
pub fn floor_to(timestamp_ns: u64, granularity_ns: u64) -> u64 {
    if granularity_ns == 0 {
        return timestamp_ns;
    }
    timestamp_ns - timestamp_ns % granularity_ns
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}

/// Named numeric deltas derived from one validated event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSample(BTreeMap<String, f64>);

impl MetricSample {
    /// Creates an empty sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn set(&mut self, field: impl Into<String>, value: f64) {
        self.0.insert(field.into(), value);
    }

    /// Returns a field's value.
    pub fn get(&self, field: &str) -> Option<f64> {
        self.0.get(field).copied()
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sample has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MetricSample {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Aggregate state of one (namespace, bucket_start) window.
///
/// Fields start absent and accumulate as samples merge in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowState {
    metrics: BTreeMap<String, f64>,
}

impl WindowState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a field's value, or `None` while it is absent.
    pub fn get(&self, field: &str) -> Option<f64> {
        self.metrics.get(field).copied()
    }

    /// Returns a field's value, treating absent as zero.
    pub fn value(&self, field: &str) -> f64 {
        self.get(field).unwrap_or(0.0)
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of present fields.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether no field is present.
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Sets a field directly. Used when decoding stored windows.
    pub fn set(&mut self, field: impl Into<String>, value: f64) {
        self.metrics.insert(field.into(), value);
    }

    /// Merges a sample into this state in place.
    pub fn merge_sample(&mut self, sample: &MetricSample, program: &CombineProgram) {
        for (field, value) in sample.iter() {
            merge_field(&mut self.metrics, field, value, program.op_for(field));
        }
    }

    /// Merges another window into this state in place.
    pub fn merge(&mut self, other: &WindowState, program: &CombineProgram) {
        for (field, value) in other.iter() {
            merge_field(&mut self.metrics, field, value, program.op_for(field));
        }
    }
}

impl From<MetricSample> for WindowState {
    fn from(sample: MetricSample) -> Self {
        Self { metrics: sample.0 }
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for WindowState {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[inline]
fn merge_field(metrics: &mut BTreeMap<String, f64>, field: &str, value: f64, op: MergeOp) {
    match metrics.get_mut(field) {
        Some(current) => *current = op.apply(*current, value),
        None => {
            metrics.insert(field.to_string(), value);
        }
    }
}

/// Merges `right` into an optional prior state.
///
/// An absent prior state adopts `right`; otherwise fields merge with the
/// program's per-field operation.
///
/// ```rust
/// use tally::program::CombineProgram;
/// use tally::window::{combine, WindowState};
///
/// let program = CombineProgram::default();
/// let a: WindowState = [("total", 2.0)].into_iter().collect();
/// let b: WindowState = [("total", 1.0), ("success", 1.0)].into_iter().collect();
///
/// assert_eq!(combine(None, &a, &program), a);
/// let merged = combine(Some(&a), &b, &program);
/// assert_eq!(merged.get("total"), Some(3.0));
/// assert_eq!(merged.get("success"), Some(1.0));
/// ```
pub fn combine(prior: Option<&WindowState>, right: &WindowState, program: &CombineProgram) -> WindowState {
    match prior {
        None => right.clone(),
        Some(prior) => {
            let mut merged = prior.clone();
            merged.merge(right, program);
            merged
        }
    }
}

/// Folds a sequence of optional windows. Absent entries contribute nothing.
pub fn fold<'a, I>(windows: I, program: &CombineProgram) -> WindowState
where
    I: IntoIterator<Item = Option<&'a WindowState>>,
{
    windows
        .into_iter()
        .flatten()
        .fold(WindowState::new(), |mut acc, window| {
            acc.merge(window, program);
            acc
        })
}

/// Lifecycle phase of a live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPhase {
    /// Holds contributions that no store write has acknowledged yet.
    Open,
    /// Every contribution so far is acknowledged by the store.
    Persisted,
    /// A write exhausted its retries; store contents may be stale.
    Degraded,
}

/// Why a bucket left the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// More than `cardinality` buckets were live.
    Capacity,
    /// The bucket fell behind the retention horizon.
    Age,
}

#[derive(Debug, Default)]
struct CellInner {
    state: WindowState,
    version: u64,
    persisted_version: u64,
    degraded_version: Option<u64>,
    seeded: bool,
    retired: bool,
}

/// A point-in-time copy of a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    /// Start of the bucket.
    pub bucket_start: u64,
    /// The state at the time of the snapshot.
    pub state: WindowState,
    /// Number of state changes applied.
    pub version: u64,
    /// Lifecycle phase.
    pub phase: WindowPhase,
    /// Whether previously stored state for the bucket is folded in.
    pub seeded: bool,
}

/// The single logical owner of one bucket's state.
///
/// All access goes through one mutex, so a merge is never observed half
/// applied and concurrent contributions to the same bucket serialize.
///
/// A new cell is unseeded: the store may already hold state for its bucket
/// from an earlier, evicted cell. The persistence writer folds that state
/// in with [`WindowCell::seed`] before the cell's first write, so a
/// reopened bucket extends what was stored instead of replacing it.
///
/// Once evicted, a cell is retired and refuses further merges; the
/// reducer then opens a fresh cell for the bucket.
#[derive(Debug)]
pub struct WindowCell {
    bucket_start: u64,
    inner: Mutex<CellInner>,
}

impl WindowCell {
    /// Creates an empty, unseeded cell.
    pub fn new(bucket_start: u64) -> Self {
        Self {
            bucket_start,
            inner: Mutex::new(CellInner::default()),
        }
    }

    /// Creates a cell holding restored state, considered seeded and persisted.
    pub fn restored(bucket_start: u64, state: WindowState) -> Self {
        Self {
            bucket_start,
            inner: Mutex::new(CellInner {
                state,
                version: 1,
                persisted_version: 1,
                seeded: true,
                ..CellInner::default()
            }),
        }
    }

    /// Returns the bucket start.
    pub fn bucket_start(&self) -> u64 {
        self.bucket_start
    }

    /// Merges a sample and returns the new state and its version.
    ///
    /// A retired cell still accepts the merge; use
    /// [`WindowCell::merge_with`] to respect retirement.
    pub fn merge(&self, sample: &MetricSample, program: &CombineProgram) -> (WindowState, u64) {
        let mut inner = self.inner.lock();
        inner.state.merge_sample(sample, program);
        inner.version += 1;
        (inner.state.clone(), inner.version)
    }

    /// Merges a sample unless the cell is retired, then runs `commit` with
    /// the new version before releasing the cell lock.
    ///
    /// Returns `None`, without calling `commit`, if the cell is retired.
    pub fn merge_with<F>(&self, sample: &MetricSample, program: &CombineProgram, commit: F) -> Option<(WindowState, u64)>
    where
        F: FnOnce(u64),
    {
        let mut inner = self.inner.lock();
        if inner.retired {
            return None;
        }
        inner.state.merge_sample(sample, program);
        inner.version += 1;
        commit(inner.version);
        Some((inner.state.clone(), inner.version))
    }

    /// Folds previously stored state into an unseeded cell.
    ///
    /// Returns `false` if the cell was already seeded.
    pub fn seed(&self, stored: Option<&WindowState>, program: &CombineProgram) -> bool {
        let mut inner = self.inner.lock();
        if inner.seeded {
            return false;
        }
        inner.seeded = true;
        if let Some(stored) = stored {
            inner.state.merge(stored, program);
            inner.version += 1;
        }
        true
    }

    /// Whether stored state for the bucket has been folded in.
    pub fn is_seeded(&self) -> bool {
        self.inner.lock().seeded
    }

    /// Stops the cell from accepting merges.
    pub fn retire(&self) {
        self.inner.lock().retired = true;
    }

    /// Whether the cell has left its ring.
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    /// Returns a consistent copy of the cell.
    pub fn snapshot(&self) -> CellSnapshot {
        let inner = self.inner.lock();
        CellSnapshot {
            bucket_start: self.bucket_start,
            state: inner.state.clone(),
            version: inner.version,
            phase: phase_of(&inner),
            seeded: inner.seeded,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> WindowState {
        self.inner.lock().state.clone()
    }

    /// Returns the current version.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Records that the store acknowledged the state at `version`.
    pub fn mark_persisted(&self, version: u64) {
        let mut inner = self.inner.lock();
        inner.persisted_version = inner.persisted_version.max(version);
        if inner.degraded_version.is_some_and(|d| version >= d) {
            inner.degraded_version = None;
        }
    }

    /// Records that writing the state at `version` failed for good.
    pub fn mark_degraded(&self, version: u64) {
        let mut inner = self.inner.lock();
        if inner.persisted_version < version {
            inner.degraded_version = Some(inner.degraded_version.map_or(version, |d| d.max(version)));
        }
    }

    /// Returns the lifecycle phase.
    pub fn phase(&self) -> WindowPhase {
        phase_of(&self.inner.lock())
    }

    /// Whether the last failed write has not been superseded.
    pub fn is_degraded(&self) -> bool {
        self.phase() == WindowPhase::Degraded
    }
}

fn phase_of(inner: &CellInner) -> WindowPhase {
    if inner.degraded_version.is_some() {
        WindowPhase::Degraded
    } else if inner.persisted_version >= inner.version {
        WindowPhase::Persisted
    } else {
        WindowPhase::Open
    }
}

/// Fixed-capacity ordered set of live buckets for one namespace.
#[derive(Debug)]
pub struct WindowRing {
    capacity: usize,
    cells: BTreeMap<u64, Arc<WindowCell>>,
}

impl WindowRing {
    /// Creates a ring retaining at most `capacity` buckets.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: (capacity as usize).max(1),
            cells: BTreeMap::new(),
        }
    }

    /// Returns the maximum number of live buckets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the cell for `bucket_start`, creating it when absent.
    ///
    /// Creating a cell may push the ring over capacity; the oldest cells
    /// are then evicted and returned. When the new bucket is older than
    /// every retained bucket it is itself the one evicted, but the
    /// returned cell is still valid for the caller's merge.
    pub fn open(&mut self, bucket_start: u64) -> (Arc<WindowCell>, Vec<Arc<WindowCell>>) {
        if let Some(cell) = self.cells.get(&bucket_start) {
            return (Arc::clone(cell), Vec::new());
        }

        let cell = Arc::new(WindowCell::new(bucket_start));
        self.cells.insert(bucket_start, Arc::clone(&cell));

        let mut evicted = Vec::new();
        while self.cells.len() > self.capacity {
            if let Some((_, oldest)) = self.cells.pop_first() {
                evicted.push(oldest);
            }
        }
        (cell, evicted)
    }

    /// Inserts a restored cell, evicting the oldest beyond capacity.
    pub fn restore(&mut self, cell: WindowCell) -> Vec<Arc<WindowCell>> {
        self.cells.insert(cell.bucket_start(), Arc::new(cell));
        let mut evicted = Vec::new();
        while self.cells.len() > self.capacity {
            if let Some((_, oldest)) = self.cells.pop_first() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Returns the cell for `bucket_start`, if live.
    pub fn get(&self, bucket_start: u64) -> Option<Arc<WindowCell>> {
        self.cells.get(&bucket_start).cloned()
    }

    /// Returns live cells with `start <= bucket_start < end`, oldest first.
    pub fn range(&self, start: u64, end: u64) -> Vec<Arc<WindowCell>> {
        if start >= end {
            return Vec::new();
        }
        self.cells.range(start..end).map(|(_, c)| Arc::clone(c)).collect()
    }

    /// Returns every live cell, oldest first.
    pub fn cells(&self) -> Vec<Arc<WindowCell>> {
        self.cells.values().cloned().collect()
    }

    /// Evicts and returns all cells older than `horizon`.
    pub fn evict_before(&mut self, horizon: u64) -> Vec<Arc<WindowCell>> {
        let retained = self.cells.split_off(&horizon);
        let evicted = std::mem::replace(&mut self.cells, retained);
        evicted.into_values().collect()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no bucket is live.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Start of the oldest live bucket.
    pub fn oldest_bucket(&self) -> Option<u64> {
        self.cells.keys().next().copied()
    }

    /// Start of the newest live bucket.
    pub fn newest_bucket(&self) -> Option<u64> {
        self.cells.keys().next_back().copied()
    }
}
