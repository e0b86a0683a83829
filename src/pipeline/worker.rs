//! Indexing threads: load content, run the index function, hand writes to the writer pool.
//!
//! Per task: `Queued -> Loading -> (TooLarge | LoadFailed | Cancelled-requeued | Loaded) ->
//! Indexing -> Applying -> Done`. The `Done` bookkeeping lives in [`FileCompletion`], which runs
//! once when its last clone drops: after the final write for the file was applied, or as soon as
//! the file failed.

use log::{debug, error, log, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::content_loader::{ContentLoader, LoadedContent};
use crate::engine::writer_pool::WriterPool;
use crate::error::{Cancelled, LoadError};
use crate::pipeline::job::IndexingJob;
use crate::pipeline::registry::JobRegistry;
use crate::types::{
    CancellationToken, FileClassifier, FileIndexingTask, IndexFunction, IndexWrite,
};
use crate::utils::config::PackagePaths;

/// Collaborators shared by every indexing thread.
pub struct IndexingContext {
    pub registry: Arc<JobRegistry>,
    pub loader: ContentLoader,
    pub writers: WriterPool,
    pub classifier: Arc<dyn FileClassifier>,
    pub index_fn: Arc<dyn IndexFunction>,
    /// Size of the indexing pool; feeds the writer backpressure threshold.
    pub indexing_threads: usize,
}

/// Render a caught panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Terminal bookkeeping for one loaded file, shared by the indexing thread and every write task.
struct FileCompletion {
    job: Arc<IndexingJob>,
    task: FileIndexingTask,
    file_name: String,
    file_type: String,
    bytes: u64,
    load_time: Duration,
    started: Instant,
    failure: Mutex<Option<String>>,
    release_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FileCompletion {
    /// Mark the file failed and record the job error (first one wins).
    fn fail(&self, msg: String) {
        warn!("{}", msg);
        self.job.set_error(msg.clone());
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        failure.get_or_insert(msg);
    }

    fn set_release_hook(&self, hook: Option<Box<dyn FnOnce() + Send>>) {
        *self
            .release_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }
}

impl Drop for FileCompletion {
    fn drop(&mut self) {
        let hook = self
            .release_hook
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook
            && panic::catch_unwind(AssertUnwindSafe(hook)).is_err()
        {
            warn!("release hook for {} panicked", self.file_name);
        }
        let failed = self
            .failure
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if failed {
            self.task.file_set.record_failed();
        } else {
            self.task.file_set.record_indexed(
                &self.file_type,
                self.bytes,
                self.started.elapsed(),
                self.load_time,
            );
        }
        self.job.finish_task(&self.task);
    }
}

/// Process one task of `job`. Per-file failures are recorded and swallowed; only cancellation
/// escapes, after the task was put back on the queue.
///
/// The dequeued task stays in a slot until whichever path accounts for it takes it out. A panic
/// from any collaborator before that point fails the task here, so the countdown still moves.
pub fn process_one(ctx: &IndexingContext, job: &Arc<IndexingJob>) -> Result<(), Cancelled> {
    let cancel = job.cancellation();
    ctx.writers.throttle(ctx.indexing_threads, cancel.as_ref());

    let Some(task) = job.take_task() else {
        return Ok(());
    };
    let mut slot = Some(task);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_task(ctx, job, &mut slot, cancel.as_ref())
    }));
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let msg = format!(
                "job {}: processing a file panicked: {}",
                job.id(),
                panic_message(payload.as_ref())
            );
            warn!("{}", msg);
            job.set_error(msg);
            if let Some(task) = slot.take() {
                task.file_set.record_failed();
                job.finish_task(&task);
            }
            Ok(())
        }
    }
}

/// Load the task in `slot` and hand it on. Takes the task out of the slot exactly when its
/// accounting moves elsewhere (finished, requeued, or owned by a [`FileCompletion`]).
fn run_task(
    ctx: &IndexingContext,
    job: &Arc<IndexingJob>,
    slot: &mut Option<FileIndexingTask>,
    cancel: &dyn CancellationToken,
) -> Result<(), Cancelled> {
    let Some(task) = slot.as_ref() else {
        return Ok(());
    };

    let content = match ctx.loader.load(task.file.as_ref(), cancel) {
        Ok(content) => content,
        Err(LoadError::ContentTooLarge { file }) => {
            debug!("{} is too large to index, skipping", file);
            task.file_set.record_too_large(file);
            if let Some(task) = slot.take() {
                job.finish_task(&task);
            }
            return Ok(());
        }
        Err(LoadError::LoadFailed { file, kind, cause }) => {
            log!(kind.log_level(), "Failed to load {}: {:#}", file, cause);
            task.file_set.record_load_failed();
            if let Some(task) = slot.take() {
                job.finish_task(&task);
            }
            return Ok(());
        }
        Err(LoadError::Cancelled(c)) => {
            if let Some(task) = slot.take() {
                debug!("job {}: load cancelled, task requeued", job.id());
                job.requeue(task);
            }
            return Err(c);
        }
    };

    index_loaded(ctx, job, slot, content);
    Ok(())
}

/// Classify, index and submit writes for a loaded file. The content reservation is released when
/// this returns, after the index function is done with the bytes.
fn index_loaded(
    ctx: &IndexingContext,
    job: &Arc<IndexingJob>,
    slot: &mut Option<FileIndexingTask>,
    content: LoadedContent,
) {
    let Some(task) = slot.as_ref() else {
        return;
    };
    let started = Instant::now();
    let file = Arc::clone(&task.file);
    let file_name = file.name();

    let classified = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.classifier.classify(file.as_ref(), content.bytes())
    }));
    let file_type = classified.unwrap_or_else(|_| "unknown".to_string());

    let Some(task) = slot.take() else {
        return;
    };
    let completion = Arc::new(FileCompletion {
        job: Arc::clone(job),
        task,
        file_name: file_name.clone(),
        file_type,
        bytes: content.length(),
        load_time: content.load_time(),
        started,
        failure: Mutex::new(None),
        release_hook: Mutex::new(None),
    });

    let computed = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.index_fn
            .index(file.as_ref(), content.bytes(), &completion.file_type)
    }));
    content.release();

    let batch = match computed {
        Ok(Ok(batch)) => batch,
        Ok(Err(e)) => {
            completion.fail(format!("indexing {} failed: {:#}", file_name, e));
            return;
        }
        Err(payload) => {
            completion.fail(format!(
                "indexing {} panicked: {}",
                file_name,
                panic_message(payload.as_ref())
            ));
            return;
        }
    };

    completion.set_release_hook(batch.release_hook);
    for write in batch.writes {
        submit_write(ctx, &completion, &file_name, write);
    }
}

fn submit_write(
    ctx: &IndexingContext,
    completion: &Arc<FileCompletion>,
    file_name: &str,
    write: IndexWrite,
) {
    let IndexWrite { index, apply } = write;
    let partition = ctx.writers.partition_for(&index);
    let task_completion = Arc::clone(completion);
    let label = format!("{} for {}", index, file_name);
    let submitted = ctx.writers.submit(
        partition,
        Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(apply)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => task_completion.fail(format!("writing {} failed: {:#}", label, e)),
                Err(payload) => task_completion.fail(format!(
                    "writing {} panicked: {}",
                    label,
                    panic_message(payload.as_ref())
                )),
            }
            drop(task_completion);
        }),
    );
    if let Err(e) = submitted {
        completion.fail(format!("submitting {} for {}: {:#}", index, file_name, e));
    }
}

/// Bounded pool of indexing threads draining every registered job.
pub struct IndexingWorkerPool {
    ctx: Arc<IndexingContext>,
    live: Arc<AtomicUsize>,
    spawned_total: AtomicUsize,
}

/// Decrements the live-worker count when a worker thread exits, normally or by panic.
struct LiveWorkerGuard(Arc<AtomicUsize>);

impl Drop for LiveWorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drain the registry until it is idle. A panic outside a task (e.g. from a suspender) ends this
/// worker only; the orchestrator tops the pool up again on its next poll.
fn worker_loop(ctx: Arc<IndexingContext>) {
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        ctx.registry.run_fair(|job| {
            if let Err(Cancelled) = process_one(&ctx, job) {
                debug!("job {} cancelled; moving on", job.id());
            }
        })
    }));
    if let Err(payload) = run {
        error!(
            "Indexing worker stopped by a panic: {}",
            panic_message(payload.as_ref())
        );
    }
}

impl IndexingWorkerPool {
    pub fn new(ctx: Arc<IndexingContext>) -> Self {
        Self {
            ctx,
            live: Arc::new(AtomicUsize::new(0)),
            spawned_total: AtomicUsize::new(0),
        }
    }

    pub fn context(&self) -> &Arc<IndexingContext> {
        &self.ctx
    }

    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Worker threads started over the pool's lifetime, replacements included.
    pub fn spawned_workers(&self) -> usize {
        self.spawned_total.load(Ordering::SeqCst)
    }

    /// Top the pool up to `indexing_threads` live workers. Returns how many were spawned.
    pub fn ensure_workers(&self) -> usize {
        let max = self.ctx.indexing_threads.max(1);
        let mut spawned = 0;
        loop {
            let live = self.live.load(Ordering::SeqCst);
            if live >= max {
                break;
            }
            if self
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            let n = self.spawned_total.fetch_add(1, Ordering::Relaxed);
            let ctx = Arc::clone(&self.ctx);
            let guard = LiveWorkerGuard(Arc::clone(&self.live));
            let spawn = thread::Builder::new()
                .name(PackagePaths::get().thread_name("indexer", n))
                .spawn(move || {
                    let _guard = guard;
                    worker_loop(ctx);
                });
            match spawn {
                Ok(_) => spawned += 1,
                Err(e) => {
                    // The closure (and its guard) was dropped, so the live count is already back.
                    warn!("Could not spawn indexing thread: {}", e);
                    break;
                }
            }
        }
        if spawned > 0 {
            debug!("Spawned {} indexing threads", spawned);
        }
        spawned
    }
}
