//! Pipeline orchestrator.
//!
//! Wires the stages together:
//!
//! ```text
//! Event -> Classifier -> Filter -> Reducer -> persistence queue -> Store
//!                                      \                            /
//!                                       +------- Monitor ----------+
//! ```
//!
//! Classification and filtering run on the caller's task. Reduction takes
//! only the namespace ring lock and the bucket lock. Persistence is
//! asynchronous: `ingest` reserves a place in the namespace's queue
//! (waiting only when it is full), then reduces and queues the write
//! without yielding, so a merged window is never left without a write.
//!
//! # Lifecycle
//!
//! 1. [`Pipeline::start`] registers every namespace with its store,
//!    restores snapshots and spawns the writer tasks and the ticker
//! 2. [`Pipeline::ingest`] is called for each event, from any task
//! 3. [`Pipeline::tick`] runs event-time age eviction and snapshotting
//!    (the ticker calls it every `tick_interval`)
//! 4. [`Pipeline::shutdown`] stops intake, drains every queue, writes
//!    snapshots and flushes the store

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CHECKPOINT_FILE, Checkpoint};
use crate::classify::Classifier;
use crate::config::PipelineConfig;
use crate::durable::SlabStore;
use crate::error::{ClassificationError, ConfigError, MonitorError, Result, TallyError};
use crate::event::Event;
use crate::export::PromExporter;
use crate::filter;
use crate::monitor::{self, MonitorRecord};
use crate::namespace::NamespaceConfig;
use crate::persist::{PersistJob, Persister};
use crate::reduce::{EvictionHook, Reducer};
use crate::registry::{Registry, Rejected};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::store::{StoreRouter, WindowStore};
use crate::window::{EvictionReason, WindowCell, WindowState, now_ns};

/// Outcome of a successfully ingested event.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    /// Namespace that accepted the event.
    pub namespace: String,
    /// Bucket the event landed in.
    pub bucket_start: u64,
    /// Bucket state after the merge.
    pub state: WindowState,
    /// Version of `state`.
    pub version: u64,
}

struct StatsHook {
    stats: Arc<PipelineStats>,
}

impl EvictionHook for StatsHook {
    fn on_evict(&self, _namespace: &str, cell: &WindowCell, reason: EvictionReason) {
        self.stats.record_evictions(1);
        if cell.is_degraded() {
            warn!(bucket_start = cell.bucket_start(), ?reason, "evicted a window whose last write failed");
        }
    }
}

struct Ticker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    registry: Registry,
    classifier: Classifier,
    reducer: Reducer,
    store: Arc<dyn WindowStore>,
    persister: Persister,
    stats: Arc<PipelineStats>,
    checkpoint_path: Option<PathBuf>,
    checkpoint: Mutex<Checkpoint>,
    closed: AtomicBool,
}

/// A running aggregation pipeline.
pub struct Pipeline {
    inner: Arc<Inner>,
    ticker: Mutex<Option<Ticker>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("namespaces", &self.inner.registry.namespaces().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Starts a pipeline, opening the durable store when `config.data_dir`
    /// is set.
    ///
    /// Namespaces whose store cannot be served are rejected individually
    /// and listed in [`Pipeline::rejected`].
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Store`] if the data directory cannot be opened.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use tally::config::PipelineConfig;
    /// use tally::event::Event;
    /// use tally::pipeline::Pipeline;
    /// use tally::registry::Registry;
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let registry = Registry::load("./config")?;
    /// let pipeline = Pipeline::start(registry, PipelineConfig::default()).await?;
    ///
    /// pipeline.ingest(&Event::new("G1", "OK", 1_700_000_000_000_000_000)).await?;
    /// let record = pipeline.monitor_now("NS1").await?;
    /// println!("total = {}", record.metric("total"));
    ///
    /// pipeline.shutdown().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(registry: Registry, config: PipelineConfig) -> Result<Self> {
        let store: Arc<dyn WindowStore> = match &config.data_dir {
            Some(dir) => Arc::new(StoreRouter::with_durable(SlabStore::open(dir)?)),
            None => Arc::new(StoreRouter::memory_only()),
        };
        Self::start_with_store(registry, config, store).await
    }

    /// Starts a pipeline over a caller-provided store.
    ///
    /// # Errors
    ///
    /// Registration failures never fail the call: each affected namespace
    /// is rejected on its own and listed in [`Pipeline::rejected`].
    pub async fn start_with_store(
        mut registry: Registry,
        config: PipelineConfig,
        store: Arc<dyn WindowStore>,
    ) -> Result<Self> {
        let mut failures = Vec::new();
        for ns in registry.namespaces() {
            if let Err(error) = register(store.as_ref(), ns, &config).await {
                failures.push(Rejected {
                    origin: ns.name.clone(),
                    error,
                });
            }
        }
        for failure in &failures {
            error!(namespace = %failure.origin, error = %failure.error, "namespace registration failed");
        }
        registry.reject_registered(failures);

        let names: Vec<&str> = registry.namespaces().iter().map(|ns| ns.name.as_str()).collect();
        let stats = Arc::new(PipelineStats::new(names.iter().copied()));
        let reducer = Reducer::new(registry.namespaces().iter().cloned()).with_hook(Arc::new(StatsHook {
            stats: Arc::clone(&stats),
        }));

        let checkpoint_path = config.data_dir.as_ref().map(|dir| dir.join(CHECKPOINT_FILE));
        let checkpoint = match &checkpoint_path {
            Some(path) => restore_snapshots(path, &registry, &reducer),
            None => Checkpoint::default(),
        };

        let persister = Persister::spawn(
            Arc::clone(&store),
            registry.namespaces().iter().map(Arc::as_ref),
            &config,
            Arc::clone(&stats),
        );
        let classifier = registry.classifier();

        info!(
            namespaces = registry.namespaces().len(),
            rejected = registry.rejected().len(),
            durable = config.data_dir.is_some(),
            "pipeline started"
        );

        let inner = Arc::new(Inner {
            registry,
            classifier,
            reducer,
            store,
            persister,
            stats,
            checkpoint_path,
            checkpoint: Mutex::new(checkpoint),
            closed: AtomicBool::new(false),
        });

        let ticker = (!config.tick_interval.is_zero()).then(|| spawn_ticker(Arc::clone(&inner), config.tick_interval));

        Ok(Self {
            inner,
            ticker: Mutex::new(ticker),
        })
    }

    /// Classifies, filters and reduces one event, then queues its window
    /// for persistence.
    ///
    /// When the event's group has several namespaces, each candidate's
    /// filter is tried in registration order and the first that accepts
    /// owns the event.
    ///
    /// # Errors
    ///
    /// - [`TallyError::Classification`] if no namespace matches
    /// - [`TallyError::Filter`] if every candidate filter rejects the event
    /// - [`TallyError::ShutDown`] after [`Pipeline::shutdown`]
    ///
    /// Per-event errors leave every window untouched.
    pub async fn ingest(&self, event: &Event) -> Result<Ingested> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(TallyError::ShutDown);
        }
        inner.stats.record_processed();

        let started = Instant::now();
        let result = self.route(event).await;
        inner.stats.record_ingest_time(started.elapsed());
        result
    }

    async fn route(&self, event: &Event) -> Result<Ingested> {
        let inner = &self.inner;

        let classification = inner.classifier.classify(event).map_err(|e| {
            inner.stats.record_classification_error();
            debug!(domain = %event.domain, error = %e, "event not classified");
            e
        })?;

        let mut rejection = None;
        for namespace in classification.namespaces {
            let Some(windows) = inner.reducer.namespace(namespace) else {
                continue;
            };

            let sample = match filter::filter(event, windows.config()) {
                Ok(sample) => sample,
                Err(e) => {
                    inner.stats.record_filtered(namespace);
                    debug!(namespace = %namespace, code = %event.code, error = %e, "filter rejected event");
                    rejection = Some(e);
                    continue;
                }
            };

            let slot = inner.persister.reserve(namespace).await?;
            let Some(outcome) = inner
                .reducer
                .reduce_with(namespace, event.start_time, &sample, |cell, version| {
                    slot.send(PersistJob::new(cell, version));
                })
            else {
                continue;
            };
            inner.stats.record_accepted();

            debug!(namespace = %namespace, bucket_start = outcome.bucket_start, "event reduced");
            return Ok(Ingested {
                namespace: namespace.to_string(),
                bucket_start: outcome.bucket_start,
                state: outcome.state,
                version: outcome.version,
            });
        }

        match rejection {
            Some(e) => {
                warn!(namespace = %e.namespace(), domain = %event.domain, code = %event.code, "event rejected by filter");
                Err(e.into())
            }
            None => Err(TallyError::Classification(ClassificationError::UnroutedGroup {
                group: classification.group.to_string(),
                domain: event.domain.clone(),
            })),
        }
    }

    /// Folds a namespace's windows around `query_time` (nanoseconds).
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::UnknownNamespace`] for an unregistered
    /// namespace and [`MonitorError::Range`] if the store read fails.
    pub async fn monitor(&self, namespace: &str, query_time: u64) -> std::result::Result<MonitorRecord, MonitorError> {
        let windows = self
            .inner
            .reducer
            .namespace(namespace)
            .ok_or_else(|| MonitorError::UnknownNamespace {
                namespace: namespace.to_string(),
            })?;

        let started = Instant::now();
        let result = monitor::monitor(self.inner.store.as_ref(), windows, query_time).await;
        self.inner.stats.record_monitor_time(started.elapsed());
        result
    }

    /// Folds a namespace's windows around the current wall-clock time.
    ///
    /// # Errors
    ///
    /// See [`Pipeline::monitor`].
    pub async fn monitor_now(&self, namespace: &str) -> std::result::Result<MonitorRecord, MonitorError> {
        self.monitor(namespace, now_ns()).await
    }

    /// Evicts windows behind each namespace's event-time horizon and
    /// writes snapshots when a snapshotting namespace changed. Returns the
    /// number of evicted windows.
    pub fn tick(&self) -> usize {
        self.inner.tick()
    }

    /// Waits until every queued write has been attempted, then flushes the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Store`] if the store flush fails.
    pub async fn flush(&self) -> Result<()> {
        self.inner.persister.flush().await;
        self.inner.store.flush().await?;
        Ok(())
    }

    /// Stops intake, drains every persistence queue, writes snapshots and
    /// flushes the store. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Store`] if the final store flush fails.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.stop.send(true);
            if let Err(e) = ticker.handle.await {
                error!(error = %e, "ticker task panicked");
            }
        }

        self.inner.persister.close().await;
        self.inner.write_checkpoint(now_ns());
        self.inner.store.flush().await?;

        let stats = self.inner.stats.snapshot();
        info!(
            processed = stats.processed,
            accepted = stats.accepted,
            persisted = stats.persisted,
            degraded = stats.degraded,
            "pipeline shut down"
        );
        Ok(())
    }

    /// Renders every namespace's monitor record at `query_time` and the
    /// pipeline counters in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns the first [`MonitorError`]; nothing is rendered then.
    pub async fn export_prometheus(
        &self,
        exporter: PromExporter,
        query_time: u64,
    ) -> std::result::Result<String, MonitorError> {
        let mut exporter = exporter;
        for namespace in self.namespaces() {
            let record = self.monitor(&namespace.name, query_time).await?;
            exporter.add_record(namespace, &record);
        }
        exporter.add_stats(&self.stats(), self.namespaces().len());
        Ok(exporter.render())
    }

    /// Returns a snapshot of the pipeline counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Registered namespaces in registration order.
    pub fn namespaces(&self) -> &[Arc<NamespaceConfig>] {
        self.inner.registry.namespaces()
    }

    /// Namespaces rejected at load or registration time.
    pub fn rejected(&self) -> &[Rejected] {
        self.inner.registry.rejected()
    }

    /// Whether [`Pipeline::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn tick(&self) -> usize {
        let evicted = self.reducer.evict_aged();
        if evicted > 0 {
            debug!(evicted, "aged windows evicted");
        }
        self.write_checkpoint(now_ns());
        evicted
    }

    fn write_checkpoint(&self, now: u64) {
        let Some(path) = &self.checkpoint_path else {
            return;
        };

        let mut checkpoint = self.checkpoint.lock();
        let mut changed = false;
        for ns in self.registry.namespaces().iter().filter(|ns| ns.snapshot) {
            if let Some(windows) = self.reducer.namespace(&ns.name) {
                changed |= checkpoint.capture(windows, now);
            }
        }
        if !changed {
            return;
        }

        if let Err(e) = checkpoint.save(path) {
            error!(path = %path.display(), error = %e, "failed to write snapshot");
        }
    }
}

async fn register(
    store: &dyn WindowStore,
    ns: &NamespaceConfig,
    config: &PipelineConfig,
) -> std::result::Result<(), ConfigError> {
    if ns.snapshot && config.data_dir.is_none() {
        return Err(ConfigError::UnsupportedStore {
            namespace: ns.name.clone(),
            store_type: "snapshot".to_string(),
            reason: "snapshots require a data directory".to_string(),
        });
    }

    store.register(ns).await.map_err(|e| ConfigError::UnsupportedStore {
        namespace: ns.name.clone(),
        store_type: ns.store_type.as_str().to_string(),
        reason: e.to_string(),
    })
}

fn restore_snapshots(path: &std::path::Path, registry: &Registry, reducer: &Reducer) -> Checkpoint {
    let checkpoint = match Checkpoint::load(path) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            error!(path = %path.display(), error = %e, "ignoring unreadable snapshot");
            return Checkpoint::default();
        }
    };

    for ns in registry.namespaces().iter().filter(|ns| ns.snapshot) {
        match checkpoint.restore(ns, reducer) {
            Ok(0) => {}
            Ok(restored) => info!(namespace = %ns.name, restored, "restored windows from snapshot"),
            Err(e) => warn!(namespace = %ns.name, error = %e, "skipping snapshot"),
        }
    }
    checkpoint
}

fn spawn_ticker(inner: Arc<Inner>, interval: std::time::Duration) -> Ticker {
    let (stop, mut stopped) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    inner.tick();
                }
                _ = stopped.changed() => break,
            }
        }
        debug!("ticker stopped");
    });
    Ticker { stop, handle }
}
