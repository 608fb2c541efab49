//! Monitor query engine: fold retained windows into one record.
//!
//! A monitor query covers the last `monitor.window` buckets (default:
//! the namespace cardinality) ending at the bucket that contains the
//! query time, or at the bucket before it when the namespace sets
//! `current = false`. Each metric field folds independently with the
//! namespace's combine program; buckets with no window contribute nothing.
//!
//! Store contents are overlaid with the live cells still retained by the
//! reducer. A seeded cell holds at least what was written for its bucket
//! and replaces the stored window; an unseeded cell has written nothing
//! yet and is combined with it. Windows whose last write exhausted its
//! retries are reported through [`MonitorRecord::stale`] and
//! [`MonitorRecord::stale_buckets`], whether the cell is still live or
//! was evicted before the failure could be repaired.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::MonitorError;
use crate::namespace::NamespaceConfig;
use crate::reduce::NamespaceWindows;
use crate::store::WindowStore;
use crate::window::{WindowPhase, WindowState, combine, floor_to, fold, now_ns};

/// Half-open bucket interval `[start, end)` covered by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketRange {
    /// Start of the oldest bucket covered.
    pub start: u64,
    /// End of the newest bucket covered (exclusive).
    pub end: u64,
}

impl BucketRange {
    /// Computes the bucket range a monitor query at `query_time` covers.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use tally::monitor::BucketRange;
    /// use tally::namespace::NamespaceConfig;
    /// use tally::program::{FilterProgram, Predicate};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let filter = FilterProgram::new(Predicate::Always, Vec::new());
    /// let mut ns = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 3, filter)?;
    ///
    /// let s = 1_000_000_000;
    /// let range = BucketRange::for_query(&ns, 150 * s);
    /// assert_eq!((range.start, range.end), (0, 180 * s));
    ///
    /// ns.current = false;
    /// let range = BucketRange::for_query(&ns, 150 * s);
    /// assert_eq!((range.start, range.end), (0, 120 * s));
    /// # Ok(())
    /// # }
    /// ```
    pub fn for_query(namespace: &NamespaceConfig, query_time: u64) -> Self {
        let granularity = namespace.granularity_ns();
        let anchor = floor_to(query_time, granularity);
        let end = if namespace.current {
            anchor.saturating_add(granularity)
        } else {
            anchor
        };
        let span = u64::from(namespace.monitor_window()).saturating_mul(granularity);
        Self {
            start: end.saturating_sub(span),
            end,
        }
    }

    /// Whether `bucket_start` lies in the range.
    pub fn contains(&self, bucket_start: u64) -> bool {
        bucket_start >= self.start && bucket_start < self.end
    }
}

/// Aggregate view of one namespace at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorRecord {
    /// Namespace queried.
    pub namespace: String,
    /// Query time, nanoseconds since the Unix epoch.
    pub query_time: u64,
    /// Wall-clock time the store range read returned.
    pub store_time: u64,
    /// Folded metrics. Declared fields with no contribution are zero.
    pub metrics: BTreeMap<String, f64>,
    /// Number of windows folded.
    pub windows: usize,
    /// Bucket interval queried.
    pub range: BucketRange,
    /// Whether any folded window failed to persist.
    pub stale: bool,
    /// Start of every degraded window in the range.
    pub stale_buckets: Vec<u64>,
}

impl MonitorRecord {
    /// Returns a folded metric, or zero when absent.
    pub fn metric(&self, field: &str) -> f64 {
        self.metrics.get(field).copied().unwrap_or(0.0)
    }
}

/// Folds the windows of one namespace around `query_time`.
///
/// # Errors
///
/// Returns [`MonitorError::Range`] if the store range read fails; no
/// partial record is produced.
pub async fn monitor(
    store: &dyn WindowStore,
    windows: &NamespaceWindows,
    query_time: u64,
) -> Result<MonitorRecord, MonitorError> {
    let config = windows.config();
    let range = BucketRange::for_query(config, query_time);

    let stored = if range.start < range.end {
        store
            .range(&config.name, range.start, range.end)
            .await
            .map_err(|source| MonitorError::Range {
                namespace: config.name.clone(),
                source,
            })?
    } else {
        Vec::new()
    };
    let store_time = now_ns();

    let mut merged: BTreeMap<u64, WindowState> = stored.into_iter().collect();
    let mut stale_buckets = windows.degraded_evicted(range.start, range.end);
    for cell in windows.cells_in(range.start, range.end) {
        let snapshot = cell.snapshot();
        if snapshot.phase == WindowPhase::Degraded {
            stale_buckets.insert(snapshot.bucket_start);
        }
        if snapshot.seeded {
            merged.insert(snapshot.bucket_start, snapshot.state);
        } else {
            // Nothing of an unseeded cell has reached the store yet.
            let stored = merged.remove(&snapshot.bucket_start);
            let state = combine(stored.as_ref(), &snapshot.state, windows.combine());
            merged.insert(snapshot.bucket_start, state);
        }
    }
    let stale_buckets: Vec<u64> = stale_buckets.into_iter().collect();

    let folded = fold(merged.values().map(Some), windows.combine());
    let fields = if config.monitor.metrics.is_empty() {
        config.metric_fields()
    } else {
        config.monitor.metrics.clone()
    };
    let metrics = fields
        .into_iter()
        .map(|field| {
            let value = folded.value(&field);
            (field, value)
        })
        .collect();

    debug!(
        namespace = %config.name,
        windows = merged.len(),
        stale = stale_buckets.len(),
        "monitor fold"
    );

    Ok(MonitorRecord {
        namespace: config.name.clone(),
        query_time,
        store_time,
        metrics,
        windows: merged.len(),
        range,
        stale: !stale_buckets.is_empty(),
        stale_buckets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::program::{CodeClass, CodeMatch, FilterProgram, MonitorProgram, Predicate};
    use crate::reduce::Reducer;
    use crate::store::MemoryStore;
    use crate::window::MetricSample;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const S: u64 = 1_000_000_000;

    fn config() -> NamespaceConfig {
        let filter = FilterProgram::new(
            Predicate::eq("domain", "G1"),
            vec![CodeClass::new("tech_error", CodeMatch::Equals("ERR1".to_string()), true)],
        );
        NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 5, filter).unwrap()
    }

    fn sample(total: f64) -> MetricSample {
        [("total", total), ("success", total)].into_iter().collect()
    }

    async fn store_for(config: &NamespaceConfig) -> MemoryStore {
        let store = MemoryStore::new();
        store.register(config).await.unwrap();
        store
    }

    #[test]
    fn test_range_saturates_at_zero() {
        let range = BucketRange::for_query(&config(), 0);
        assert_eq!(range, BucketRange { start: 0, end: 60 * S });
        assert!(range.contains(0));
        assert!(!range.contains(60 * S));
    }

    #[test]
    fn test_monitor_window_narrows_range() {
        let mut ns = config();
        ns.monitor = MonitorProgram {
            window: Some(2),
            metrics: Vec::new(),
        };
        let range = BucketRange::for_query(&ns, 600 * S);
        assert_eq!(range, BucketRange { start: 540 * S, end: 660 * S });
    }

    #[tokio::test]
    async fn test_fold_over_store_with_gaps() {
        let ns = config();
        let store = store_for(&ns).await;
        store.put("NS1", 0, &sample(3.0).into()).await.unwrap();
        store.put("NS1", 120 * S, &sample(2.0).into()).await.unwrap();

        let reducer = Reducer::new([Arc::new(ns)]);
        let record = monitor(&store, reducer.namespace("NS1").unwrap(), 130 * S).await.unwrap();

        assert_eq!(record.windows, 2);
        assert_eq!(record.metric("total"), 5.0);
        assert_eq!(record.metric("tech_error"), 0.0);
        assert!(record.metrics.contains_key("tech_error"));
        assert!(!record.stale);
        assert_eq!(record.query_time, 130 * S);
        assert!(record.store_time > 0);
    }

    #[tokio::test]
    async fn test_current_false_excludes_open_bucket() {
        let mut ns = config();
        ns.current = false;
        let store = store_for(&ns).await;
        store.put("NS1", 0, &sample(3.0).into()).await.unwrap();
        store.put("NS1", 60 * S, &sample(4.0).into()).await.unwrap();

        let reducer = Reducer::new([Arc::new(ns)]);
        let record = monitor(&store, reducer.namespace("NS1").unwrap(), 90 * S).await.unwrap();
        assert_eq!(record.metric("total"), 3.0);
    }

    #[tokio::test]
    async fn test_degraded_cell_marks_stale() {
        let ns = config();
        let store = store_for(&ns).await;
        let reducer = Reducer::new([Arc::new(ns)]);

        let outcome = reducer.reduce("NS1", 10 * S, &sample(1.0)).unwrap();
        outcome.cell.mark_degraded(outcome.version);

        let record = monitor(&store, reducer.namespace("NS1").unwrap(), 30 * S).await.unwrap();
        assert!(record.stale);
        assert_eq!(record.stale_buckets, vec![0]);
        // The unpersisted state still contributes.
        assert_eq!(record.metric("total"), 1.0);
    }

    #[tokio::test]
    async fn test_unseeded_cell_adds_to_stored_window() {
        let ns = config();
        let store = store_for(&ns).await;
        let stored: WindowState = sample(3.0).into();
        store.put("NS1", 0, &stored).await.unwrap();

        let reducer = Reducer::new([Arc::new(ns)]);
        let windows = reducer.namespace("NS1").unwrap();
        let outcome = reducer.reduce("NS1", 10 * S, &sample(1.0)).unwrap();
        let record = monitor(&store, windows, 30 * S).await.unwrap();
        assert_eq!(record.metric("total"), 4.0);

        // Once seeded, the cell alone is the window.
        outcome.cell.seed(Some(&stored), windows.combine());
        let record = monitor(&store, windows, 30 * S).await.unwrap();
        assert_eq!(record.metric("total"), 4.0);
        assert_eq!(record.windows, 1);
    }

    #[tokio::test]
    async fn test_projection() {
        let mut ns = config();
        ns.monitor.metrics = vec!["total".to_string()];
        let store = store_for(&ns).await;
        store.put("NS1", 0, &sample(2.0).into()).await.unwrap();

        let reducer = Reducer::new([Arc::new(ns)]);
        let record = monitor(&store, reducer.namespace("NS1").unwrap(), 0).await.unwrap();
        assert_eq!(record.metrics.keys().collect::<Vec<_>>(), vec!["total"]);
    }

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn register(&self, _namespace: &NamespaceConfig) -> StoreResult<()> {
            Ok(())
        }

        async fn get(&self, _namespace: &str, _bucket_start: u64) -> StoreResult<Option<WindowState>> {
            Ok(None)
        }

        async fn put(&self, _namespace: &str, _bucket_start: u64, _state: &WindowState) -> StoreResult<()> {
            Ok(())
        }

        async fn range(&self, namespace: &str, _start: u64, _end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
            Err(StoreError::Unavailable {
                namespace: namespace.to_string(),
                reason: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_range_failure_is_an_error() {
        let reducer = Reducer::new([Arc::new(config())]);
        let err = monitor(&BrokenStore, reducer.namespace("NS1").unwrap(), 0).await.unwrap_err();
        assert!(matches!(err, MonitorError::Range { .. }));
        assert_eq!(err.namespace(), "NS1");
    }
}
