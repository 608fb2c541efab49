//! Pipeline tunables.
//!
//! Loaded from an optional `tally.json` next to the namespace
//! configuration; every field has a default.
//!
//! ```json
//! {
//!   "data_dir": "/var/lib/tally",
//!   "queue_capacity": 1024,
//!   "max_retries": 3,
//!   "retry_backoff": 0.1,
//!   "tick_interval": 1.0
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::namespace::duration_serde;

/// File name of the pipeline configuration inside a config directory.
pub const PIPELINE_CONFIG_FILE: &str = "tally.json";

/// Runtime settings for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory for durable slabs and snapshots. Required by `durable`
    /// and `cached` namespaces and by snapshots.
    pub data_dir: Option<PathBuf>,
    /// Capacity of each namespace's persistence queue.
    pub queue_capacity: usize,
    /// Maximum number of retry attempts for a failed store write.
    pub max_retries: u32,
    /// Initial backoff between retries (doubles each attempt).
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
    /// Interval of the background ticker; zero disables it.
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for PipelineConfig {
    /// Defaults: no data directory, 1024 queued writes, 3 retries, 100ms
    /// initial backoff, 1s tick.
    fn default() -> Self {
        Self {
            data_dir: None,
            queue_capacity: 1024,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Creates a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    /// Sets the persistence queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial retry backoff.
    #[must_use]
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Sets the tick interval; zero disables the background ticker.
    #[must_use]
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Loads a config file, or returns defaults if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// The queue capacity, at least one.
    pub(crate) fn effective_queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_millis(100));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new()
            .with_data_dir("/tmp/tally")
            .with_queue_capacity(0)
            .with_max_retries(1)
            .with_retry_backoff(Duration::from_millis(5))
            .with_tick_interval(Duration::ZERO);

        assert_eq!(config.data_dir.as_deref(), Some(Path::new("/tmp/tally")));
        assert_eq!(config.effective_queue_capacity(), 1);
        assert_eq!(config.max_retries, 1);
        assert!(config.tick_interval.is_zero());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PIPELINE_CONFIG_FILE);
        fs::write(&path, r#"{"max_retries": 5, "retry_backoff": 0.25}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = PipelineConfig::load(dir.path().join("nope.json")).unwrap();
        assert_eq!(missing, PipelineConfig::default());

        let path = dir.path().join(PIPELINE_CONFIG_FILE);
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
