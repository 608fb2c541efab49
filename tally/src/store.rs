//! Window store interface and the in-memory adapter.
//!
//! The store is a key-value interface over (namespace, bucket_start).
//! Puts always carry the full window state, so replaying a put is
//! idempotent and the persistence path can retry freely.
//!
//! Adapters:
//! - [`MemoryStore`]: per-namespace partitions bounded by cardinality
//! - [`SlabStore`](crate::durable::SlabStore): memory-mapped slab per namespace
//! - [`CachedStore`](crate::cache::CachedStore): write-through cache over any store
//! - [`StoreRouter`]: dispatches each namespace to the adapter named by
//!   its `store_type`

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::CachedStore;
use crate::durable::SlabStore;
use crate::error::{StoreError, StoreResult};
use crate::namespace::{NamespaceConfig, StoreType};
use crate::window::WindowState;

/// Key-value persistence for window state.
///
/// Implementations must keep namespaces independent: an operation on one
/// namespace never waits on a lock held for another.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Prepares storage for a namespace. Called once before any other
    /// operation names it.
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()>;

    /// Returns the stored state of one bucket.
    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>>;

    /// Replaces the stored state of one bucket.
    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()>;

    /// Returns stored buckets with `start <= bucket_start < end`, oldest first.
    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>>;

    /// Makes prior puts durable.
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: WindowStore + ?Sized> WindowStore for Arc<T> {
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
        (**self).register(namespace).await
    }

    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        (**self).get(namespace, bucket_start).await
    }

    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
        (**self).put(namespace, bucket_start, state).await
    }

    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        (**self).range(namespace, start, end).await
    }

    async fn flush(&self) -> StoreResult<()> {
        (**self).flush().await
    }
}

#[derive(Debug)]
struct Partition {
    capacity: usize,
    windows: BTreeMap<u64, WindowState>,
}

/// In-process store with one bounded partition per namespace.
///
/// Each partition keeps at most `cardinality` buckets; a put beyond that
/// drops the oldest bucket. Partitions have their own locks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: DashMap<String, Arc<Mutex<Partition>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, namespace: &str) -> StoreResult<Arc<Mutex<Partition>>> {
        self.partitions
            .get(namespace)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| StoreError::UnregisteredNamespace {
                namespace: namespace.to_string(),
            })
    }

    /// Number of buckets held for a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.partition(namespace).map_or(0, |p| p.lock().windows.len())
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
        let capacity = namespace.cardinality as usize;
        // Re-registering keeps the existing partition and its bound.
        self.partitions
            .entry(namespace.name.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Partition {
                    capacity,
                    windows: BTreeMap::new(),
                }))
            });
        debug!(namespace = %namespace.name, capacity, "registered memory partition");
        Ok(())
    }

    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        let partition = self.partition(namespace)?;
        let guard = partition.lock();
        Ok(guard.windows.get(&bucket_start).cloned())
    }

    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
        let partition = self.partition(namespace)?;
        let mut guard = partition.lock();
        guard.windows.insert(bucket_start, state.clone());
        while guard.windows.len() > guard.capacity {
            if let Some((dropped, _)) = guard.windows.pop_first() {
                trace!(namespace, bucket_start = dropped, "memory partition dropped oldest bucket");
            }
        }
        Ok(())
    }

    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let partition = self.partition(namespace)?;
        let guard = partition.lock();
        Ok(guard
            .windows
            .range(start..end)
            .map(|(bucket, state)| (*bucket, state.clone()))
            .collect())
    }
}

/// Dispatches each namespace to the adapter named by its `store_type`.
///
/// Durable and cached namespaces share one [`SlabStore`]; a router built
/// without a data directory rejects them at registration.
#[derive(Debug)]
pub struct StoreRouter {
    memory: MemoryStore,
    durable: Option<Arc<SlabStore>>,
    cached: Option<CachedStore<Arc<SlabStore>>>,
    routes: DashMap<String, StoreType>,
}

impl StoreRouter {
    /// Creates a router with only the in-memory adapter.
    pub fn memory_only() -> Self {
        Self {
            memory: MemoryStore::new(),
            durable: None,
            cached: None,
            routes: DashMap::new(),
        }
    }

    /// Creates a router backed by a durable store.
    pub fn with_durable(durable: SlabStore) -> Self {
        let durable = Arc::new(durable);
        Self {
            memory: MemoryStore::new(),
            cached: Some(CachedStore::new(Arc::clone(&durable))),
            durable: Some(durable),
            routes: DashMap::new(),
        }
    }

    /// Returns the store type a namespace was registered with.
    pub fn route(&self, namespace: &str) -> Option<StoreType> {
        self.routes.get(namespace).map(|r| *r.value())
    }

    /// Returns the caching layer, when a data directory is configured.
    pub fn cache(&self) -> Option<&CachedStore<Arc<SlabStore>>> {
        self.cached.as_ref()
    }

    fn adapter(&self, store_type: StoreType) -> Option<&dyn WindowStore> {
        match store_type {
            StoreType::Memory => Some(&self.memory),
            StoreType::Durable => self.durable.as_deref().map(|d| d as &dyn WindowStore),
            StoreType::Cached => self.cached.as_ref().map(|c| c as &dyn WindowStore),
        }
    }

    fn resolve(&self, namespace: &str) -> StoreResult<&dyn WindowStore> {
        let store_type = self.route(namespace).ok_or_else(|| StoreError::UnregisteredNamespace {
            namespace: namespace.to_string(),
        })?;
        self.adapter(store_type).ok_or_else(|| StoreError::Unavailable {
            namespace: namespace.to_string(),
            reason: format!("no {} adapter configured", store_type.as_str()),
        })
    }
}

#[async_trait]
impl WindowStore for StoreRouter {
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
        let adapter = self
            .adapter(namespace.store_type)
            .ok_or_else(|| StoreError::Unavailable {
                namespace: namespace.name.clone(),
                reason: format!("store type '{}' requires a data directory", namespace.store_type.as_str()),
            })?;
        adapter.register(namespace).await?;
        self.routes.insert(namespace.name.clone(), namespace.store_type);
        Ok(())
    }

    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        self.resolve(namespace)?.get(namespace, bucket_start).await
    }

    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
        self.resolve(namespace)?.put(namespace, bucket_start, state).await
    }

    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        self.resolve(namespace)?.range(namespace, start, end).await
    }

    async fn flush(&self) -> StoreResult<()> {
        // The cache is write-through, so syncing the slabs covers both.
        if let Some(durable) = &self.durable {
            durable.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FilterProgram, Predicate};
    use std::time::Duration;

    fn namespace(name: &str, cardinality: u32) -> NamespaceConfig {
        let filter = FilterProgram::new(Predicate::Always, Vec::new());
        NamespaceConfig::new(name, "G1", Duration::from_secs(60), cardinality, filter).unwrap()
    }

    fn state(total: f64) -> WindowState {
        [("total", total)].into_iter().collect()
    }

    #[tokio::test]
    async fn test_memory_put_get_range() {
        let store = MemoryStore::new();
        store.register(&namespace("NS1", 10)).await.unwrap();

        store.put("NS1", 60, &state(1.0)).await.unwrap();
        store.put("NS1", 0, &state(2.0)).await.unwrap();
        store.put("NS1", 60, &state(3.0)).await.unwrap();

        assert_eq!(store.get("NS1", 60).await.unwrap(), Some(state(3.0)));
        assert_eq!(store.get("NS1", 120).await.unwrap(), None);

        let range = store.range("NS1", 0, 120).await.unwrap();
        assert_eq!(range, vec![(0, state(2.0)), (60, state(3.0))]);
        assert!(store.range("NS1", 120, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_bounded_by_cardinality() {
        let store = MemoryStore::new();
        store.register(&namespace("NS1", 3)).await.unwrap();

        for i in 0..5u64 {
            store.put("NS1", i * 60, &state(1.0)).await.unwrap();
        }

        assert_eq!(store.len("NS1"), 3);
        let starts: Vec<u64> = store.range("NS1", 0, u64::MAX).await.unwrap().into_iter().map(|(b, _)| b).collect();
        assert_eq!(starts, vec![120, 180, 240]);
    }

    #[tokio::test]
    async fn test_memory_unregistered_namespace() {
        let store = MemoryStore::new();
        let err = store.put("NOPE", 0, &state(1.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnregisteredNamespace { .. }));
    }

    #[tokio::test]
    async fn test_router_memory_only_rejects_durable() {
        let router = StoreRouter::memory_only();
        router.register(&namespace("NS1", 4)).await.unwrap();
        assert_eq!(router.route("NS1"), Some(StoreType::Memory));

        let durable = namespace("NS2", 4).with_store_type(StoreType::Durable);
        let err = router.register(&durable).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert_eq!(router.route("NS2"), None);

        router.put("NS1", 0, &state(1.0)).await.unwrap();
        assert_eq!(router.get("NS1", 0).await.unwrap(), Some(state(1.0)));
        assert!(router.get("NS2", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_router_dispatches_by_store_type() {
        let dir = tempfile::tempdir().unwrap();
        let router = StoreRouter::with_durable(SlabStore::open(dir.path()).unwrap());

        router.register(&namespace("MEM", 4)).await.unwrap();
        router
            .register(&namespace("DUR", 4).with_store_type(StoreType::Durable))
            .await
            .unwrap();
        router
            .register(&namespace("CCH", 4).with_store_type(StoreType::Cached))
            .await
            .unwrap();

        for ns in ["MEM", "DUR", "CCH"] {
            router.put(ns, 60, &state(2.0)).await.unwrap();
            assert_eq!(router.get(ns, 60).await.unwrap(), Some(state(2.0)), "{ns}");
        }
        router.flush().await.unwrap();
        assert_eq!(router.route("CCH"), Some(StoreType::Cached));
    }
}
