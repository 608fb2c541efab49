//! Process-wide pipeline counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters updated by the ingest path and the writer tasks.
#[derive(Debug, Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    accepted: AtomicU64,
    classification_errors: AtomicU64,
    filtered: HashMap<String, AtomicU64>,
    unattributed_filtered: AtomicU64,
    persisted: AtomicU64,
    retries: AtomicU64,
    degraded: AtomicU64,
    evictions: AtomicU64,
    ingest_nanos: AtomicU64,
    monitors: AtomicU64,
    monitor_nanos: AtomicU64,
}

impl PipelineStats {
    /// Creates counters for a fixed set of namespaces.
    pub fn new<'a, I>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            filtered: namespaces
                .into_iter()
                .map(|ns| (ns.to_string(), AtomicU64::new(0)))
                .collect(),
            ..Self::default()
        }
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_classification_error(&self) {
        self.classification_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self, namespace: &str) {
        let counter = self.filtered.get(namespace).unwrap_or(&self.unattributed_filtered);
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_ingest_time(&self, elapsed: Duration) {
        self.ingest_nanos.fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_monitor_time(&self, elapsed: Duration) {
        self.monitors.fetch_add(1, Ordering::Relaxed);
        self.monitor_nanos.fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut filtered: BTreeMap<String, u64> = self
            .filtered
            .iter()
            .map(|(ns, count)| (ns.clone(), count.load(Ordering::Relaxed)))
            .collect();
        let unattributed = self.unattributed_filtered.load(Ordering::Relaxed);
        if unattributed > 0 {
            filtered.insert(String::new(), unattributed);
        }

        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            classification_errors: self.classification_errors.load(Ordering::Relaxed),
            filtered,
            persisted: self.persisted.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ingest_nanos: self.ingest_nanos.load(Ordering::Relaxed),
            monitors: self.monitors.load(Ordering::Relaxed),
            monitor_nanos: self.monitor_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events offered to the pipeline.
    pub processed: u64,
    /// Events reduced into a window.
    pub accepted: u64,
    /// Events no namespace could be resolved for.
    pub classification_errors: u64,
    /// Filter rejections per namespace.
    pub filtered: BTreeMap<String, u64>,
    /// Acknowledged store writes.
    pub persisted: u64,
    /// Store write retries.
    pub retries: u64,
    /// Writes that exhausted their retries.
    pub degraded: u64,
    /// Buckets evicted by capacity or age.
    pub evictions: u64,
    /// Time spent in ingest across every processed event.
    pub ingest_nanos: u64,
    /// Monitor queries answered or failed.
    pub monitors: u64,
    /// Time spent answering monitor queries.
    pub monitor_nanos: u64,
}

impl StatsSnapshot {
    /// Total filter rejections across namespaces.
    pub fn filtered_total(&self) -> u64 {
        self.filtered.values().sum()
    }

    /// Events that reached no window: unclassified or filtered out.
    pub fn discarded(&self) -> u64 {
        self.classification_errors + self.filtered_total()
    }
}

fn duration_nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}
