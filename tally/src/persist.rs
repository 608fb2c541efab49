//! Asynchronous write-through persistence.
//!
//! Each namespace has one bounded queue and one writer task. Callers
//! reserve a queue slot before reducing, so a merged window always has a
//! write queued for it; the writer then puts the cell's current state to
//! the store, retrying failures with exponential backoff.
//!
//! - Before a cell's first write, any state the store already holds for
//!   its bucket is folded into the cell
//! - Success marks the cell persisted up to the written version
//! - Exhausted retries mark the cell degraded, which monitor queries report
//! - A later successful write of the same cell clears the degradation
//!
//! Delivery is at-least-once. Puts carry full state, so a replayed write
//! stores the same bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::PipelineConfig;
use crate::error::{Result, StoreResult, TallyError};
use crate::namespace::NamespaceConfig;
use crate::program::CombineProgram;
use crate::stats::PipelineStats;
use crate::store::WindowStore;
use crate::window::WindowCell;

/// One queued window write.
#[derive(Debug, Clone)]
pub struct PersistJob {
    /// Bucket being written.
    pub bucket_start: u64,
    /// Cell version whose merge queued this write.
    pub version: u64,
    /// Cell whose current state is written.
    pub cell: Arc<WindowCell>,
}

impl PersistJob {
    /// Creates a job for the merge that produced `version`.
    pub fn new(cell: &Arc<WindowCell>, version: u64) -> Self {
        Self {
            bucket_start: cell.bucket_start(),
            version,
            cell: Arc::clone(cell),
        }
    }
}

#[derive(Debug)]
enum Command {
    Write(PersistJob),
    Flush(oneshot::Sender<()>),
}

/// A reserved place in one namespace's queue.
///
/// Sending never waits. Dropping the slot releases it unused.
#[derive(Debug)]
pub struct WriteSlot(mpsc::OwnedPermit<Command>);

impl WriteSlot {
    /// Queues a write into the reserved place.
    pub fn send(self, job: PersistJob) {
        self.0.send(Command::Write(job));
    }
}

/// Retry settings for store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,
    /// Initial backoff between attempts (doubles each attempt).
    pub backoff: Duration,
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.retry_backoff,
        }
    }
}

/// Per-namespace writer queues.
#[derive(Debug)]
pub struct Persister {
    senders: Mutex<HashMap<String, mpsc::Sender<Command>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Persister {
    /// Spawns one writer task per namespace on the current runtime.
    pub fn spawn<'a, I>(
        store: Arc<dyn WindowStore>,
        namespaces: I,
        config: &PipelineConfig,
        stats: Arc<PipelineStats>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a NamespaceConfig>,
    {
        let policy = RetryPolicy::from(config);
        let mut senders = HashMap::new();
        let mut workers = Vec::new();

        for namespace in namespaces {
            let (tx, rx) = mpsc::channel(config.effective_queue_capacity());
            let writer = Writer {
                namespace: namespace.name.clone(),
                combine: namespace.effective_combine(),
                store: Arc::clone(&store),
                policy,
                stats: Arc::clone(&stats),
            };
            workers.push(tokio::spawn(writer.run(rx)));
            senders.insert(namespace.name.clone(), tx);
        }

        Self {
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
        }
    }

    fn sender(&self, namespace: &str) -> Result<mpsc::Sender<Command>> {
        self.senders.lock().get(namespace).cloned().ok_or(TallyError::ShutDown)
    }

    /// Reserves a place in a namespace's queue, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::ShutDown`] once the persister is closed.
    pub async fn reserve(&self, namespace: &str) -> Result<WriteSlot> {
        self.sender(namespace)?
            .reserve_owned()
            .await
            .map(WriteSlot)
            .map_err(|_| TallyError::ShutDown)
    }

    /// Queues a write, waiting for queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::ShutDown`] once the persister is closed.
    pub async fn submit(&self, namespace: &str, job: PersistJob) -> Result<()> {
        self.reserve(namespace).await?.send(job);
        Ok(())
    }

    /// Waits until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let senders: Vec<_> = self.senders.lock().values().cloned().collect();
        let mut pending = Vec::with_capacity(senders.len());
        for sender in senders {
            let (done, wait) = oneshot::channel();
            if sender.send(Command::Flush(done)).await.is_ok() {
                pending.push(wait);
            }
        }
        for wait in pending {
            // A dropped marker means the writer already exited, which also
            // means its queue is drained.
            let _ = wait.await;
        }
    }

    /// Closes every queue and waits for the writers to drain them.
    ///
    /// Slots reserved before the close still deliver their write.
    pub async fn close(&self) {
        self.senders.lock().clear();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "persistence writer panicked");
            }
        }
    }
}

struct Writer {
    namespace: String,
    combine: CombineProgram,
    store: Arc<dyn WindowStore>,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Write(job) => self.write(job).await,
                Command::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(namespace = %self.namespace, "persistence queue drained");
    }

    /// Seeds the cell on its first write, then puts its current state.
    async fn attempt(&self, cell: &WindowCell) -> StoreResult<u64> {
        if !cell.is_seeded() {
            let stored = self.store.get(&self.namespace, cell.bucket_start()).await?;
            if stored.is_some() {
                trace!(namespace = %self.namespace, bucket_start = cell.bucket_start(), "seeding reopened window");
            }
            cell.seed(stored.as_ref(), &self.combine);
        }
        let snapshot = cell.snapshot();
        self.store
            .put(&self.namespace, snapshot.bucket_start, &snapshot.state)
            .await?;
        Ok(snapshot.version)
    }

    async fn write(&self, job: PersistJob) {
        let mut backoff = self.policy.backoff;
        let mut attempt = 0;

        loop {
            match self.attempt(&job.cell).await {
                Ok(version) => {
                    job.cell.mark_persisted(version);
                    self.stats.record_persisted();
                    return;
                }
                Err(e) if attempt < self.policy.max_retries => {
                    attempt += 1;
                    self.stats.record_retry();
                    warn!(
                        namespace = %self.namespace,
                        bucket_start = job.bucket_start,
                        attempt,
                        error = %e,
                        "store write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    let version = job.cell.version();
                    job.cell.mark_degraded(version);
                    self.stats.record_degraded();
                    error!(
                        namespace = %self.namespace,
                        bucket_start = job.bucket_start,
                        version,
                        error = %e,
                        "store write exhausted retries, window degraded"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::namespace::NamespaceConfig;
    use crate::program::{FilterProgram, Predicate};
    use crate::store::MemoryStore;
    use crate::window::{MetricSample, WindowPhase, WindowState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` puts, then delegates to memory.
    struct FlakyStore {
        failures: AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl WindowStore for FlakyStore {
        async fn register(&self, namespace: &NamespaceConfig) -> StoreResult<()> {
            self.inner.register(namespace).await
        }

        async fn get(&self, namespace: &str, bucket_start: u64) -> StoreResult<Option<WindowState>> {
            self.inner.get(namespace, bucket_start).await
        }

        async fn put(&self, namespace: &str, bucket_start: u64, state: &WindowState) -> StoreResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable {
                    namespace: namespace.to_string(),
                    reason: "injected".to_string(),
                });
            }
            self.inner.put(namespace, bucket_start, state).await
        }

        async fn range(&self, namespace: &str, start: u64, end: u64) -> StoreResult<Vec<(u64, WindowState)>> {
            self.inner.range(namespace, start, end).await
        }
    }

    fn namespace() -> NamespaceConfig {
        let filter = FilterProgram::new(Predicate::Always, Vec::new());
        NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter).unwrap()
    }

    async fn flaky(failures: u32) -> Arc<FlakyStore> {
        let store = FlakyStore {
            failures: AtomicU32::new(failures),
            inner: MemoryStore::new(),
        };
        store.register(&namespace()).await.unwrap();
        Arc::new(store)
    }

    fn job(cell: &Arc<WindowCell>) -> PersistJob {
        let sample: MetricSample = [("total", 1.0)].into_iter().collect();
        let (_, version) = cell.merge(&sample, &namespace().effective_combine());
        PersistJob::new(cell, version)
    }

    fn config(max_retries: u32) -> PipelineConfig {
        PipelineConfig::new()
            .with_max_retries(max_retries)
            .with_retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_then_persist() {
        let store = flaky(2).await;
        let stats = Arc::new(PipelineStats::new(["NS1"]));
        let persister = Persister::spawn(store.clone(), [&namespace()], &config(3), stats.clone());

        let cell = Arc::new(WindowCell::new(0));
        persister.submit("NS1", job(&cell)).await.unwrap();
        persister.flush().await;

        assert_eq!(cell.phase(), WindowPhase::Persisted);
        assert!(store.get("NS1", 0).await.unwrap().is_some());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.degraded, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_then_recover() {
        let store = flaky(4).await;
        let stats = Arc::new(PipelineStats::new(["NS1"]));
        let persister = Persister::spawn(store.clone(), [&namespace()], &config(2), stats.clone());

        let cell = Arc::new(WindowCell::new(60));
        persister.submit("NS1", job(&cell)).await.unwrap();
        persister.flush().await;
        assert_eq!(cell.phase(), WindowPhase::Degraded);
        assert_eq!(stats.snapshot().degraded, 1);

        // One injected failure left: the next write retries once and lands.
        persister.submit("NS1", job(&cell)).await.unwrap();
        persister.flush().await;
        assert_eq!(cell.phase(), WindowPhase::Persisted);
        assert_eq!(store.get("NS1", 60).await.unwrap().unwrap().value("total"), 2.0);
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let store = flaky(0).await;
        let stats = Arc::new(PipelineStats::new(["NS1"]));
        let persister = Persister::spawn(store.clone(), [&namespace()], &config(0), stats.clone());

        for bucket in [0u64, 60, 120] {
            let cell = Arc::new(WindowCell::new(bucket));
            persister.submit("NS1", job(&cell)).await.unwrap();
        }
        persister.close().await;

        assert_eq!(stats.snapshot().persisted, 3);
        let cell = Arc::new(WindowCell::new(180));
        assert!(matches!(persister.submit("NS1", job(&cell)).await, Err(TallyError::ShutDown)));
        persister.flush().await;
    }

    #[tokio::test]
    async fn test_reserved_slot_survives_close() {
        let store = flaky(0).await;
        let stats = Arc::new(PipelineStats::new(["NS1"]));
        let persister = Persister::spawn(store.clone(), [&namespace()], &config(0), stats.clone());

        let slot = persister.reserve("NS1").await.unwrap();
        let cell = Arc::new(WindowCell::new(0));
        let closing = tokio::spawn(async move {
            persister.close().await;
            persister
        });
        tokio::task::yield_now().await;
        slot.send(job(&cell));

        let persister = closing.await.unwrap();
        assert_eq!(cell.phase(), WindowPhase::Persisted);
        assert_eq!(stats.snapshot().persisted, 1);
        assert!(matches!(persister.reserve("NS1").await, Err(TallyError::ShutDown)));
    }

    #[tokio::test]
    async fn test_first_write_seeds_from_store() {
        let store = flaky(0).await;
        let stored: WindowState = [("total", 5.0)].into_iter().collect();
        store.put("NS1", 60, &stored).await.unwrap();

        let stats = Arc::new(PipelineStats::new(["NS1"]));
        let persister = Persister::spawn(store.clone(), [&namespace()], &config(0), stats);

        let cell = Arc::new(WindowCell::new(60));
        persister.submit("NS1", job(&cell)).await.unwrap();
        persister.submit("NS1", job(&cell)).await.unwrap();
        persister.flush().await;

        // Seeded once, then both merges on top.
        assert_eq!(store.get("NS1", 60).await.unwrap().unwrap().value("total"), 7.0);
        assert_eq!(cell.state().value("total"), 7.0);
        assert_eq!(cell.phase(), WindowPhase::Persisted);
    }
}
