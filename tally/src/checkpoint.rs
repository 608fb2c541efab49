//! Snapshot files for namespaces with `snapshot = true`.
//!
//! The pipeline captures the live windows of every snapshotting namespace
//! on each tick and at shutdown, rewriting the file only when a capture
//! changed, and restores them into the reducer at start. Restored windows
//! count as persisted.
//!
//! The checkpoint is a single JSON file in the data directory:
//!
//! ```json
//! {
//!   "namespaces": {
//!     "NS1": {
//!       "granularity_ns": 60000000000,
//!       "taken_at": 1700000000000000000,
//!       "windows": [{ "bucket_start": 0, "state": { "total": 3.0 } }]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::namespace::NamespaceConfig;
use crate::reduce::{NamespaceWindows, Reducer};
use crate::window::WindowState;

/// File name of the checkpoint inside the data directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// One captured window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotWindow {
    /// Start of the bucket.
    pub bucket_start: u64,
    /// State at capture time.
    pub state: WindowState,
}

/// Captured windows of one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    /// Granularity at capture time; restoring under another granularity fails.
    pub granularity_ns: u64,
    /// Capture time, nanoseconds since the Unix epoch.
    pub taken_at: u64,
    /// Live windows, oldest first.
    pub windows: Vec<SnapshotWindow>,
}

/// Snapshots of every snapshotting namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    namespaces: BTreeMap<String, NamespaceSnapshot>,
}

impl Checkpoint {
    /// Loads a checkpoint from a file, or returns empty if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| CheckpointError::Load {
            path: path.display().to_string(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| CheckpointError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Saves the checkpoint, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).map_err(|e| CheckpointError::Serialize { source: e })?;

        let staging = path.with_extension("json.tmp");
        let save_failed = |e| CheckpointError::Save {
            path: path.display().to_string(),
            source: e,
        };
        fs::write(&staging, content).map_err(save_failed)?;
        fs::rename(&staging, path).map_err(save_failed)?;
        Ok(())
    }

    /// Replaces the snapshot of one namespace with its current live windows.
    ///
    /// Returns `false`, leaving the snapshot and its capture time as they
    /// were, when the live windows match what was last captured.
    pub fn capture(&mut self, windows: &NamespaceWindows, taken_at: u64) -> bool {
        let config = windows.config();
        let captured: Vec<SnapshotWindow> = windows
            .cells()
            .iter()
            .map(|cell| SnapshotWindow {
                bucket_start: cell.bucket_start(),
                state: cell.state(),
            })
            .collect();

        let unchanged = match self.namespaces.get(&config.name) {
            Some(previous) => previous.granularity_ns == config.granularity_ns() && previous.windows == captured,
            None => captured.is_empty(),
        };
        if unchanged {
            return false;
        }

        self.namespaces.insert(
            config.name.clone(),
            NamespaceSnapshot {
                granularity_ns: config.granularity_ns(),
                taken_at,
                windows: captured,
            },
        );
        true
    }

    /// Restores one namespace's snapshot into the reducer.
    ///
    /// Returns the number of restored windows; zero when the checkpoint
    /// holds nothing for the namespace.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::GranularityMismatch`] if the snapshot was
    /// taken under a different granularity.
    pub fn restore(&self, config: &NamespaceConfig, reducer: &Reducer) -> Result<usize, CheckpointError> {
        let Some(snapshot) = self.namespaces.get(&config.name) else {
            return Ok(0);
        };

        if snapshot.granularity_ns != config.granularity_ns() {
            return Err(CheckpointError::GranularityMismatch {
                namespace: config.name.clone(),
                found_ns: snapshot.granularity_ns,
                expected_ns: config.granularity_ns(),
            });
        }

        let mut restored = 0;
        for window in &snapshot.windows {
            if reducer.restore(&config.name, window.bucket_start, window.state.clone()) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Returns the snapshot of a namespace.
    pub fn namespace(&self, name: &str) -> Option<&NamespaceSnapshot> {
        self.namespaces.get(name)
    }

    /// Whether no namespace has a snapshot.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FilterProgram, Predicate};
    use crate::window::MetricSample;
    use std::sync::Arc;
    use std::time::Duration;

    const S: u64 = 1_000_000_000;

    fn config(granularity: u64) -> Arc<NamespaceConfig> {
        let filter = FilterProgram::new(Predicate::Always, Vec::new());
        Arc::new(
            NamespaceConfig::new("NS1", "G1", Duration::from_secs(granularity), 4, filter)
                .unwrap()
                .with_snapshot(true),
        )
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        let reducer = Reducer::new([config(60)]);
        let sample: MetricSample = [("total", 1.0)].into_iter().collect();
        for t in [0, 10, 70] {
            reducer.reduce("NS1", t * S, &sample).unwrap();
        }

        let mut checkpoint = Checkpoint::default();
        assert!(checkpoint.capture(reducer.namespace("NS1").unwrap(), 99));
        assert!(!checkpoint.capture(reducer.namespace("NS1").unwrap(), 100));
        checkpoint.save(&path).unwrap();
        assert!(!dir.path().join("checkpoint.json.tmp").exists());

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.namespace("NS1").unwrap().taken_at, 99);

        let fresh = Reducer::new([config(60)]);
        assert_eq!(loaded.restore(&config(60), &fresh).unwrap(), 2);
        let cells = fresh.namespace("NS1").unwrap().cells();
        assert_eq!(cells[0].state().value("total"), 2.0);
        assert_eq!(cells[1].bucket_start(), 60 * S);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::load(dir.path().join(CHECKPOINT_FILE)).unwrap();
        assert!(checkpoint.is_empty());
        assert_eq!(checkpoint.restore(&config(60), &Reducer::new([config(60)])).unwrap(), 0);
    }

    #[test]
    fn test_granularity_mismatch() {
        let reducer = Reducer::new([config(60)]);
        reducer
            .reduce("NS1", 0, &[("total", 1.0)].into_iter().collect())
            .unwrap();
        let mut checkpoint = Checkpoint::default();
        assert!(checkpoint.capture(reducer.namespace("NS1").unwrap(), 0));

        let err = checkpoint.restore(&config(30), &Reducer::new([config(30)])).unwrap_err();
        assert!(matches!(err, CheckpointError::GranularityMismatch { .. }));
    }

    #[test]
    fn test_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        fs::write(&path, "[").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(CheckpointError::Parse { .. })));
    }
}
