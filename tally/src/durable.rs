//! Durable window store backed by memory-mapped slabs.
//!
//! # File Layout
//!
//! ```text
//! data_dir/
//! ├── meta.json          <- Namespace layouts and their hashes
//! └── windows/
//!     ├── ns_0.slab      <- One slab per registered namespace
//!     ├── ns_1.slab
//!     └── ...
//! ```
//!
//! Namespaces are registered lazily. The first registration creates the
//! slab and records the layout in `meta.json`; later registrations (in
//! this or a later process) reopen the slab and reject a configuration
//! whose layout hash differs from the recorded one.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::namespace::NamespaceConfig;
use crate::ring::{SlabRing, WriteOutcome};
use crate::slab::Slab;
use crate::store::WindowStore;
use crate::window::WindowState;

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the data directory.
pub const METADATA_FILE: &str = "meta.json";

/// Directory holding the slab files.
const WINDOWS_DIR: &str = "windows";

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Metadata format version.
    pub version: u32,
    /// Registered namespace layouts, in registration order.
    pub namespaces: Vec<NamespaceLayout>,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            namespaces: Vec::new(),
        }
    }
}

impl StoreMetadata {
    /// Reads `meta.json` from a data directory.
    ///
    /// Returns `None` if the directory has no metadata yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or
    /// parsed, or has an unsupported version.
    pub fn read<P: AsRef<Path>>(dir: P) -> StoreResult<Option<Self>> {
        let path = dir.as_ref().join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).map_err(|source| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source,
        })?;
        let metadata: Self = serde_json::from_str(&json)?;

        if metadata.version != METADATA_VERSION {
            return Err(StoreError::CorruptedMetadata {
                reason: format!(
                    "unsupported metadata version: expected {METADATA_VERSION}, found {}",
                    metadata.version
                ),
            });
        }
        Ok(Some(metadata))
    }

    fn write(&self, dir: &Path) -> StoreResult<()> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source,
        })
    }

    /// Looks up a namespace layout by name.
    pub fn namespace(&self, name: &str) -> Option<&NamespaceLayout> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }
}

/// Recorded layout of one namespace's slab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceLayout {
    /// Namespace name.
    pub name: String,
    /// Slab file, relative to the data directory.
    pub file: String,
    /// Bucket granularity in nanoseconds.
    pub granularity_ns: u64,
    /// Number of slots.
    pub cardinality: u32,
    /// Value columns in order.
    pub fields: Vec<String>,
    /// Layout hash of the configuration that created the slab.
    pub hash: u64,
}

/// Store adapter keeping each namespace in its own memory-mapped slab.
#[derive(Debug)]
pub struct SlabStore {
    path: PathBuf,
    metadata: Mutex<StoreMetadata>,
    rings: DashMap<String, Arc<Mutex<SlabRing>>>,
}

impl SlabStore {
    /// Opens a data directory, creating it when missing.
    ///
    /// # Errors
    ///
    /// - [`StoreError::DirectoryAccess`] if the directory cannot be created
    /// - [`StoreError::CorruptedMetadata`] if `meta.json` is invalid
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let windows = path.join(WINDOWS_DIR);
        fs::create_dir_all(&windows).map_err(|source| StoreError::DirectoryAccess {
            path: windows.display().to_string(),
            source,
        })?;

        let metadata = match StoreMetadata::read(&path)? {
            Some(metadata) => metadata,
            None => {
                let metadata = StoreMetadata::default();
                metadata.write(&path)?;
                metadata
            }
        };

        info!(path = %path.display(), namespaces = metadata.namespaces.len(), "opened durable store");

        Ok(Self {
            path,
            metadata: Mutex::new(metadata),
            rings: DashMap::new(),
        })
    }

    /// Returns the data directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the current metadata.
    pub fn metadata(&self) -> StoreMetadata {
        self.metadata.lock().clone()
    }

    fn ring(&self, namespace: &str) -> StoreResult<Arc<Mutex<SlabRing>>> {
        self.rings
            .get(namespace)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StoreError::UnregisteredNamespace {
                namespace: namespace.to_string(),
            })
    }

    fn open_ring(&self, config: &NamespaceConfig) -> StoreResult<SlabRing> {
        let expected = config.layout_hash();
        let mut metadata = self.metadata.lock();

        if let Some(layout) = metadata.namespace(&config.name) {
            if layout.hash != expected {
                return Err(StoreError::LayoutMismatch {
                    namespace: config.name.clone(),
                    existing: layout.hash,
                    expected,
                });
            }

            let slab = Slab::open(self.path.join(&layout.file))?;
            if slab.layout_hash() != expected {
                return Err(StoreError::LayoutMismatch {
                    namespace: config.name.clone(),
                    existing: slab.layout_hash(),
                    expected,
                });
            }
            debug!(namespace = %config.name, file = %layout.file, "reopened namespace slab");
            return Ok(SlabRing::new(config.name.as_str(), slab, layout.fields.clone())?);
        }

        let fields = config.metric_fields();
        let file = format!("{WINDOWS_DIR}/ns_{}.slab", metadata.namespaces.len());
        #[allow(clippy::cast_possible_truncation)] // field count bounded by the filter program
        let slab = Slab::create(
            self.path.join(&file),
            expected,
            config.cardinality,
            fields.len() as u32,
            config.granularity_ns(),
        )?;

        metadata.namespaces.push(NamespaceLayout {
            name: config.name.clone(),
            file: file.clone(),
            granularity_ns: config.granularity_ns(),
            cardinality: config.cardinality,
            fields: fields.clone(),
            hash: expected,
        });
        metadata.write(&self.path)?;

        debug!(namespace = %config.name, file = %file, slots = config.cardinality, "created namespace slab");
        Ok(SlabRing::new(config.name.as_str(), slab, fields)?)
    }
}

#[async_trait]
impl WindowStore for SlabStore {
    async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
        if let Some(layout) = self.metadata.lock().namespace(&namespace.name) {
            if self.rings.contains_key(&namespace.name) && layout.hash == namespace.layout_hash() {
                return Ok(());
            }
        }

        let ring = self.open_ring(namespace)?;
        self.rings.insert(namespace.name.clone(), Arc::new(Mutex::new(ring)));
        Ok(())
    }

    async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
        let ring = self.ring(namespace)?;
        let guard = ring.lock();
        guard.read(bucket_start)
    }

    async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
        let ring = self.ring(namespace)?;
        let outcome = ring.lock().write(bucket_start, state)?;
        if let WriteOutcome::Superseded { oldest } = outcome {
            debug!(namespace, bucket_start, oldest, "ignored write older than every retained bucket");
        }
        Ok(())
    }

    async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
        let ring = self.ring(namespace)?;
        let guard = ring.lock();
        guard.range(start, end)
    }

    async fn flush(&self) -> StoreResult<()> {
        let rings: Vec<_> = self.rings.iter().map(|r| Arc::clone(r.value())).collect();
        for ring in rings {
            ring.lock().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{CodeClass, CodeMatch, FilterProgram, Predicate};
    use std::time::Duration;

    fn namespace(name: &str) -> NamespaceConfig {
        let filter = FilterProgram::new(
            Predicate::eq("domain", "G1"),
            vec![CodeClass::new("tech_error", CodeMatch::Equals("ERR1".to_string()), true)],
        );
        NamespaceConfig::new(name, "G1", Duration::from_secs(60), 5, filter).unwrap()
    }

    #[tokio::test]
    async fn test_register_writes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlabStore::open(dir.path()).unwrap();
        store.register(&namespace("NS1")).await.unwrap();
        store.register(&namespace("NS2")).await.unwrap();

        let metadata = StoreMetadata::read(dir.path()).unwrap().unwrap();
        assert_eq!(metadata.namespaces.len(), 2);
        let ns1 = metadata.namespace("NS1").unwrap();
        assert_eq!(ns1.file, "windows/ns_0.slab");
        assert_eq!(ns1.fields, vec!["total", "success", "tech_error"]);
        assert!(dir.path().join("windows/ns_1.slab").exists());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlabStore::open(dir.path()).unwrap();
        store.register(&namespace("NS1")).await.unwrap();
        store.put("NS1", 0, &[("total", 1.0)].into_iter().collect()).await.unwrap();
        store.register(&namespace("NS1")).await.unwrap();

        assert_eq!(store.metadata().namespaces.len(), 1);
        assert!(store.get("NS1", 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlabStore::open(dir.path()).unwrap();
        store.register(&namespace("NS1")).await.unwrap();

        let err = store
            .put("NS1", 0, &[("latency", 1.0)].into_iter().collect())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { .. }));
    }

    #[test]
    fn test_corrupted_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILE), "{ not json").unwrap();
        assert!(matches!(SlabStore::open(dir.path()), Err(StoreError::MetadataSerialize(_))));

        fs::write(dir.path().join(METADATA_FILE), r#"{"version": 9, "namespaces": []}"#).unwrap();
        assert!(matches!(SlabStore::open(dir.path()), Err(StoreError::CorruptedMetadata { .. })));
    }
}
