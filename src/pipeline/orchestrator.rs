//! Entry point: turn file sets into a job, run it on the shared pool (or on the calling thread),
//! and report statistics plus at most one error.

use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::engine::content_loader::ContentLoader;
use crate::engine::memory_budget::MemoryBudget;
use crate::engine::writer_pool::{WriterPool, WriterPoolConfig};
use crate::error::IndexingError;
use crate::pipeline::job::IndexingJob;
use crate::pipeline::registry::JobRegistry;
use crate::pipeline::worker::{IndexingContext, IndexingWorkerPool, process_one};
use crate::types::{
    CancellationToken, ContentCache, ExtensionClassifier, FileClassifier, FileSet, IndexFunction,
    IndexingStats, TooLargePredicate, too_large_over,
};
use crate::utils::config::{DEFAULT_MAX_INDEXED_FILE_SIZE, PipelineConfig, SchedulingConsts};

/// Where a job's tasks run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Registered with the shared registry and drained by the worker pool.
    #[default]
    Pooled,
    /// Processed on the calling thread. For callers holding a lock the workers would need.
    CallerThread,
}

/// Result of one run: statistics always, and the single error that stopped it, if any.
#[derive(Debug)]
pub struct IndexingReport {
    pub stats: IndexingStats,
    pub error: Option<IndexingError>,
}

impl IndexingReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(IndexingError::Cancelled))
    }

    pub fn into_result(self) -> Result<IndexingStats> {
        match self.error {
            None => Ok(self.stats),
            Some(e) => Err(e.into()),
        }
    }
}

/// Builder for [`IndexingRuntime`]. Only the content cache and index function are required.
pub struct IndexingRuntimeBuilder {
    config: PipelineConfig,
    cache: Arc<dyn ContentCache>,
    index_fn: Arc<dyn IndexFunction>,
    budget: Option<Arc<MemoryBudget>>,
    classifier: Arc<dyn FileClassifier>,
    too_large: TooLargePredicate,
}

impl IndexingRuntimeBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing budget (e.g. one per process) instead of creating one from the config.
    pub fn memory_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn FileClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn too_large(mut self, predicate: TooLargePredicate) -> Self {
        self.too_large = predicate;
        self
    }

    pub fn build(self) -> Result<IndexingRuntime> {
        let config = self.config;
        let budget = self
            .budget
            .unwrap_or_else(|| Arc::new(MemoryBudget::new(config.memory_capacity)));
        let writers = WriterPool::new(WriterPoolConfig {
            hot_indexes: config.hot_indexes.clone(),
            aux_partitions: config.aux_partitions,
            writes_per_indexing_thread: config.writes_per_indexing_thread,
            fail_on_drain_timeout: config.fail_on_drain_timeout,
        })?;
        let ctx = Arc::new(IndexingContext {
            registry: Arc::new(JobRegistry::new()),
            loader: ContentLoader::new(budget, self.cache, self.too_large),
            writers,
            classifier: self.classifier,
            index_fn: self.index_fn,
            indexing_threads: config.indexing_threads.max(1),
        });
        debug!(
            "Indexing runtime: {} indexing threads, {} writer partitions, {} byte budget",
            ctx.indexing_threads,
            ctx.writers.partition_count(),
            ctx.loader.budget().capacity()
        );
        Ok(IndexingRuntime {
            workers: IndexingWorkerPool::new(ctx),
            config,
        })
    }
}

/// Composition root: one registry, one memory budget, one writer pool, one indexing pool.
/// Jobs from concurrent [`index_files`](Self::index_files) calls share all of them.
pub struct IndexingRuntime {
    workers: IndexingWorkerPool,
    config: PipelineConfig,
}

/// Deregisters a job when a run ends, however it ends.
struct Registration<'a> {
    registry: &'a JobRegistry,
    job: &'a IndexingJob,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.job.dispose();
        self.registry.deregister(self.job.id());
    }
}

impl IndexingRuntime {
    pub fn builder(
        cache: Arc<dyn ContentCache>,
        index_fn: Arc<dyn IndexFunction>,
    ) -> IndexingRuntimeBuilder {
        IndexingRuntimeBuilder {
            config: PipelineConfig::default(),
            cache,
            index_fn,
            budget: None,
            classifier: Arc::new(ExtensionClassifier),
            too_large: too_large_over(DEFAULT_MAX_INDEXED_FILE_SIZE),
        }
    }

    /// Shared collaborators, for driving [`process_one`] by hand.
    pub fn context(&self) -> &IndexingContext {
        self.workers.context()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn memory_budget(&self) -> &Arc<MemoryBudget> {
        self.context().loader.budget()
    }

    pub fn writers(&self) -> &WriterPool {
        &self.context().writers
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.context().registry
    }

    pub fn live_workers(&self) -> usize {
        self.workers.live_workers()
    }

    pub fn spawned_workers(&self) -> usize {
        self.workers.spawned_workers()
    }

    /// Index `file_sets` as one job and wait for it. Returns immediately when there is nothing to
    /// index.
    pub fn index_files(
        &self,
        file_sets: Vec<Arc<FileSet>>,
        cancel: Arc<dyn CancellationToken>,
        mode: RunMode,
    ) -> IndexingReport {
        if file_sets.iter().all(|s| s.is_empty()) {
            return IndexingReport {
                stats: IndexingStats::collect(0, &file_sets),
                error: None,
            };
        }
        let job = Arc::new(IndexingJob::new(file_sets));
        self.run_job(&job, cancel, mode)
    }

    /// Run (or re-run) `job`. A job stopped by cancellation keeps its requeued tasks, so running it
    /// again with a fresh token finishes the remaining files.
    pub fn run_job(
        &self,
        job: &Arc<IndexingJob>,
        cancel: Arc<dyn CancellationToken>,
        mode: RunMode,
    ) -> IndexingReport {
        let started = Instant::now();
        job.start_run(cancel);

        let mut error = {
            let _registration = Registration {
                registry: &self.context().registry,
                job,
            };
            let outcome = match mode {
                RunMode::Pooled => self.run_pooled(job),
                RunMode::CallerThread => self.run_in_caller_thread(job),
            };
            outcome.err()
        };

        if error.is_some() {
            self.quiesce(job);
        }
        if let Err(e) = self.context().writers.drain(self.config.drain_timeout) {
            warn!("job {}: {:#}", job.id(), e);
            error.get_or_insert(IndexingError::DrainTimeout(format!("{:#}", e)));
        }

        let stats = job.stats();
        match &error {
            None => info!(
                "Indexed {} of {} files ({} too large, {} failed to load) in {:?}",
                stats.successful,
                stats.attempted,
                stats.too_large,
                stats.load_failed,
                started.elapsed()
            ),
            Some(e) => info!("job {} stopped after {:?}: {}", job.id(), started.elapsed(), e),
        }
        IndexingReport { stats, error }
    }

    /// Register the job, keep the pool topped up and poll until drained, failed or cancelled.
    fn run_pooled(&self, job: &Arc<IndexingJob>) -> Result<(), IndexingError> {
        self.context().registry.register(Arc::clone(job));
        loop {
            if let Some(e) = job.error() {
                return Err(IndexingError::JobFatal(e));
            }
            if job.is_drained() {
                return Ok(());
            }
            if job.is_cancelled() {
                return Err(IndexingError::Cancelled);
            }
            self.workers.ensure_workers();
            job.wait_drained(SchedulingConsts::POLL_INTERVAL);
        }
    }

    /// Process every task on this thread, then wait for the writers to apply them.
    fn run_in_caller_thread(&self, job: &Arc<IndexingJob>) -> Result<(), IndexingError> {
        loop {
            if let Some(e) = job.error() {
                return Err(IndexingError::JobFatal(e));
            }
            if job.is_cancelled() {
                return Err(IndexingError::Cancelled);
            }
            if job.has_no_more_work() {
                break;
            }
            if job.is_suspended() {
                thread::sleep(SchedulingConsts::ALL_SUSPENDED_PAUSE);
                continue;
            }
            process_one(self.context(), job)?;
        }
        loop {
            // A failing write records its error before the countdown can reach zero.
            let drained = job.wait_drained(SchedulingConsts::POLL_INTERVAL);
            if let Some(e) = job.error() {
                return Err(IndexingError::JobFatal(e));
            }
            if drained {
                return Ok(());
            }
        }
    }

    /// Wait (bounded by the drain timeout) for tasks of an aborted job that are still being
    /// loaded, indexed or written.
    fn quiesce(&self, job: &IndexingJob) {
        let deadline = Instant::now() + self.config.drain_timeout;
        while job.in_flight() > 0 && Instant::now() < deadline {
            thread::sleep(SchedulingConsts::QUIESCE_POLL);
        }
        if job.in_flight() > 0 {
            warn!(
                "job {}: {} tasks still in flight after abort",
                job.id(),
                job.in_flight()
            );
        }
    }
}
