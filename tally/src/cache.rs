//! Write-through caching layer over any [`WindowStore`].
//!
//! Each namespace gets a bounded in-memory partition holding its newest
//! `cardinality` buckets. Puts go to the backend first and only reach the
//! cache once the backend acknowledges, so the cache never holds state the
//! backend lost.
//!
//! A partition tracks a `floor`: every bucket at or above it is either
//! cached or absent from the backend too. Reads at or above the floor are
//! served from memory; older reads fall through to the backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::namespace::NamespaceConfig;
use crate::store::WindowStore;
use crate::window::WindowState;

#[derive(Debug)]
struct CachePartition {
    capacity: usize,
    windows: BTreeMap<u64, WindowState>,
    floor: u64,
}

impl CachePartition {
    fn insert(&mut self, bucket_start: u64, state: WindowState) {
        self.windows.insert(bucket_start, state);
        while self.windows.len() > self.capacity {
            if let Some((evicted, _)) = self.windows.pop_first() {
                self.floor = self.floor.max(evicted.saturating_add(1));
            }
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from memory.
    pub hits: u64,
    /// Reads that went to the backend.
    pub misses: u64,
    /// Acknowledged write-through puts.
    pub writes: u64,
}

/// Write-through cache in front of a backend store.
#[derive(Debug)]
pub struct CachedStore<B> {
    backend: B,
    partitions: DashMap<String, Arc<Mutex<CachePartition>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl<B: WindowStore> CachedStore<B> {
    /// Wraps a backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            partitions: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Number of buckets cached for a namespace.
    pub fn cached_len(&self, namespace: &str) -> usize {
        self.partition(namespace).map_or(0, |p| p.lock().windows.len())
    }

    fn partition(&self, namespace: &str) -> StoreResult<Arc<Mutex<CachePartition>>> {
        self.partitions
            .get(namespace)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| StoreError::UnregisteredNamespace {
                namespace: namespace.to_string(),
            })
    }
}

#[async_trait]
impl<B: WindowStore> WindowStore for CachedStore<B> {
    /// Registers with the backend, then warms the partition from it.
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
        self.backend.register(namespace).await?;
        let stored = self.backend.range(&namespace.name, 0, u64::MAX).await?;

        let mut partition = CachePartition {
            capacity: namespace.cardinality as usize,
            windows: BTreeMap::new(),
            floor: 0,
        };
        let warmed = stored.len();
        for (bucket_start, state) in stored {
            partition.insert(bucket_start, state);
        }

        debug!(namespace = %namespace.name, warmed, floor = partition.floor, "warmed cache partition");
        self.partitions
            .insert(namespace.name.clone(), Arc::new(Mutex::new(partition)));
        Ok(())
    }

    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        let partition = self.partition(namespace)?;
        {
            let guard = partition.lock();
            if bucket_start >= guard.floor {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(guard.windows.get(&bucket_start).cloned());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.backend.get(namespace, bucket_start).await
    }

    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
        let partition = self.partition(namespace)?;
        self.backend.put(namespace, bucket_start, state).await?;

        let mut guard = partition.lock();
        if bucket_start >= guard.floor {
            guard.insert(bucket_start, state.clone());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let partition = self.partition(namespace)?;

        let (floor, cached) = {
            let guard = partition.lock();
            let from = start.max(guard.floor);
            let cached: Vec<_> = if from < end {
                guard
                    .windows
                    .range(from..end)
                    .map(|(bucket, state)| (*bucket, state.clone()))
                    .collect()
            } else {
                Vec::new()
            };
            (guard.floor, cached)
        };

        if start >= floor {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let mut older = self.backend.range(namespace, start, end.min(floor)).await?;
        older.extend(cached);
        Ok(older)
    }

    async fn flush(&self) -> StoreResult<()> {
        self.backend.flush().await
    }
}
