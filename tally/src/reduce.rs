//! Window reducer: folds metric samples into per-bucket state.
//!
//! The reducer owns one [`WindowRing`] per namespace. Reducing a sample:
//! 1. floors the event time to the namespace granularity
//! 2. opens (or creates) the bucket's cell under the short-held ring lock,
//!    retiring any cells pushed out by capacity before the lock is released
//! 3. merges the sample under the cell's own lock and commits it to the
//!    persistence queue before that lock is released
//! 4. runs the eviction hook for the retired cells
//!
//! Every write of a retired cell is therefore queued before any write of
//! the fresh cell that replaces it, so a per-namespace FIFO writer always
//! sees a bucket's history in order.
//!
//! Age eviction follows event time: each namespace keeps a watermark of
//! the newest event time it has reduced, and buckets more than
//! `cardinality` buckets behind it are evicted.
//!
//! Namespaces never share a lock, and two buckets of one namespace only
//! share the ring lock for the instant it takes to look up a cell.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::namespace::NamespaceConfig;
use crate::program::CombineProgram;
use crate::window::{EvictionReason, MetricSample, WindowCell, WindowPhase, WindowRing, WindowState};

/// Callback run for every bucket that leaves a namespace ring.
pub trait EvictionHook: Send + Sync {
    /// Called once per evicted cell, after it has left the ring.
    fn on_evict(&self, namespace: &str, cell: &WindowCell, reason: EvictionReason);
}

/// Result of reducing one sample.
#[derive(Debug, Clone)]
pub struct ReduceOutcome {
    /// Start of the bucket the sample landed in.
    pub bucket_start: u64,
    /// Bucket state after the merge.
    pub state: WindowState,
    /// Version of `state`, increasing per merge.
    pub version: u64,
    /// The cell, for acknowledging persistence.
    pub cell: Arc<WindowCell>,
}

/// Live windows of a single namespace.
#[derive(Debug)]
pub struct NamespaceWindows {
    config: Arc<NamespaceConfig>,
    combine: CombineProgram,
    ring: Mutex<WindowRing>,
    watermark: AtomicU64,
    // Evicted cells whose writes had not all landed, by bucket.
    unsettled: Mutex<BTreeMap<u64, Arc<WindowCell>>>,
}

impl NamespaceWindows {
    /// Creates an empty ring sized by the namespace cardinality.
    pub fn new(config: Arc<NamespaceConfig>) -> Self {
        Self {
            combine: config.effective_combine(),
            ring: Mutex::new(WindowRing::new(config.cardinality)),
            watermark: AtomicU64::new(0),
            unsettled: Mutex::new(BTreeMap::new()),
            config,
        }
    }

    /// Returns the namespace configuration.
    pub fn config(&self) -> &Arc<NamespaceConfig> {
        &self.config
    }

    /// Returns the effective combine program.
    pub fn combine(&self) -> &CombineProgram {
        &self.combine
    }

    /// Newest event time reduced into this namespace.
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    fn reduce<F>(
        &self,
        event_time: u64,
        sample: &MetricSample,
        hook: Option<&dyn EvictionHook>,
        commit: F,
    ) -> ReduceOutcome
    where
        F: FnOnce(&Arc<WindowCell>, u64),
    {
        let bucket_start = self.config.bucket_start(event_time);
        self.watermark.fetch_max(event_time, Ordering::AcqRel);

        let mut commit = Some(commit);
        loop {
            let (cell, evicted) = {
                let mut ring = self.ring.lock();
                let (cell, evicted) = ring.open(bucket_start);
                for other in evicted.iter().filter(|c| !Arc::ptr_eq(c, &cell)) {
                    self.retire(other);
                }
                (cell, evicted)
            };

            let merged = cell.merge_with(sample, &self.combine, |version| {
                if let Some(commit) = commit.take() {
                    commit(&cell, version);
                }
            });

            // A sample older than every bucket of a full ring lands in a
            // cell that left the ring as it opened.
            if evicted.iter().any(|c| Arc::ptr_eq(c, &cell)) {
                self.retire(&cell);
            }
            self.evicted(evicted, EvictionReason::Capacity, hook);

            // A retired cell means an eviction won the race for the cell
            // lock; the next open finds or creates its replacement.
            let Some((state, version)) = merged else {
                continue;
            };
            trace!(namespace = %self.config.name, bucket_start, version, "merged sample");
            return ReduceOutcome {
                bucket_start,
                state,
                version,
                cell,
            };
        }
    }

    fn retire(&self, cell: &Arc<WindowCell>) {
        cell.retire();
        if cell.phase() == WindowPhase::Persisted {
            return;
        }
        let mut unsettled = self.unsettled.lock();
        unsettled.retain(|_, c| c.phase() != WindowPhase::Persisted);
        unsettled
            .entry(cell.bucket_start())
            .and_modify(|held| {
                if !held.is_degraded() {
                    *held = Arc::clone(cell);
                }
            })
            .or_insert_with(|| Arc::clone(cell));
        while unsettled.len() > self.config.cardinality as usize {
            unsettled.pop_first();
        }
    }

    fn evicted(&self, cells: Vec<Arc<WindowCell>>, reason: EvictionReason, hook: Option<&dyn EvictionHook>) -> usize {
        let count = cells.len();
        for cell in cells {
            debug!(
                namespace = %self.config.name,
                bucket_start = cell.bucket_start(),
                ?reason,
                phase = ?cell.phase(),
                "evicted window"
            );
            if let Some(hook) = hook {
                hook.on_evict(&self.config.name, &cell, reason);
            }
        }
        count
    }

    fn evict_aged(&self, hook: Option<&dyn EvictionHook>) -> usize {
        let span = u64::from(self.config.cardinality.saturating_sub(1)).saturating_mul(self.config.granularity_ns());
        let horizon = self.config.bucket_start(self.watermark()).saturating_sub(span);

        let aged = {
            let mut ring = self.ring.lock();
            let aged = ring.evict_before(horizon);
            for cell in &aged {
                self.retire(cell);
            }
            aged
        };
        self.unsettled.lock().retain(|bucket, _| *bucket >= horizon);
        self.evicted(aged, EvictionReason::Age, hook)
    }

    /// Returns live cells with `start <= bucket_start < end`, oldest first.
    pub fn cells_in(&self, start: u64, end: u64) -> Vec<Arc<WindowCell>> {
        self.ring.lock().range(start, end)
    }

    /// Returns every live cell, oldest first.
    pub fn cells(&self) -> Vec<Arc<WindowCell>> {
        self.ring.lock().cells()
    }

    /// Returns the buckets in `[start, end)` whose evicted cell's last
    /// write failed, oldest first.
    ///
    /// Such a bucket may be missing contributions in the store for good.
    pub fn degraded_evicted(&self, start: u64, end: u64) -> BTreeSet<u64> {
        if start >= end {
            return BTreeSet::new();
        }
        self.unsettled
            .lock()
            .range(start..end)
            .filter(|(_, cell)| cell.is_degraded())
            .map(|(bucket, _)| *bucket)
            .collect()
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// Whether no bucket is live.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

/// The window reducer for every registered namespace.
pub struct Reducer {
    namespaces: HashMap<String, NamespaceWindows>,
    hook: Option<Arc<dyn EvictionHook>>,
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Reducer {
    /// Creates a reducer for the given namespaces.
    pub fn new<I>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = Arc<NamespaceConfig>>,
    {
        Self {
            namespaces: namespaces
                .into_iter()
                .map(|config| (config.name.clone(), NamespaceWindows::new(config)))
                .collect(),
            hook: None,
        }
    }

    /// Installs the eviction hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn EvictionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns a namespace's live windows.
    pub fn namespace(&self, name: &str) -> Option<&NamespaceWindows> {
        self.namespaces.get(name)
    }

    /// Merges `sample` into the bucket of `namespace` containing
    /// `event_time` and returns the merged snapshot.
    ///
    /// A sample for a bucket older than every retained bucket of a full
    /// ring opens a fresh cell that is evicted at once; the returned
    /// outcome still carries the merged state so it can be persisted.
    ///
    /// Returns `None` if the namespace is not registered.
    pub fn reduce(&self, namespace: &str, event_time: u64, sample: &MetricSample) -> Option<ReduceOutcome> {
        self.reduce_with(namespace, event_time, sample, |_, _| {})
    }

    /// Like [`Reducer::reduce`], running `commit` with the cell and the
    /// merged version while the cell lock is still held.
    ///
    /// `commit` runs exactly once when the namespace is registered.
    pub fn reduce_with<F>(&self, namespace: &str, event_time: u64, sample: &MetricSample, commit: F) -> Option<ReduceOutcome>
    where
        F: FnOnce(&Arc<WindowCell>, u64),
    {
        let windows = self.namespaces.get(namespace)?;
        Some(windows.reduce(event_time, sample, self.hook.as_deref(), commit))
    }

    /// Evicts buckets that fell behind each namespace's event-time horizon.
    ///
    /// The horizon keeps the `cardinality` buckets ending with the one that
    /// contains the namespace watermark. Returns the number of evicted
    /// buckets.
    pub fn evict_aged(&self) -> usize {
        self.namespaces
            .values()
            .map(|windows| windows.evict_aged(self.hook.as_deref()))
            .sum()
    }

    /// Reinstates a persisted or checkpointed bucket.
    ///
    /// Returns `false` if the namespace is not registered.
    pub fn restore(&self, namespace: &str, bucket_start: u64, state: WindowState) -> bool {
        let Some(windows) = self.namespaces.get(namespace) else {
            return false;
        };
        let evicted = {
            let mut ring = windows.ring.lock();
            let evicted = ring.restore(WindowCell::restored(bucket_start, state));
            for cell in &evicted {
                windows.retire(cell);
            }
            evicted
        };
        windows.evicted(evicted, EvictionReason::Capacity, self.hook.as_deref());
        true
    }
}
