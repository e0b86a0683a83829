//! One indexing request: a FIFO of deduplicated file tasks and the accounting around it.
//!
//! Every task taken from the queue reaches exactly one terminal state (indexed, too large, load
//! failed, failed) and decrements `remaining` once. A task requeued after cancellation is not
//! terminal and does not touch `remaining`.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::types::{
    CancellationToken, FileIndexingTask, FileSet, IndexingStats, NeverCancelled,
    ProgressReporter, ProgressSuspender,
};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub struct IndexingJob {
    id: u64,
    queue_tx: Sender<FileIndexingTask>,
    queue_rx: Receiver<FileIndexingTask>,
    total: usize,
    remaining: AtomicUsize,
    in_flight: AtomicUsize,
    no_more_work: AtomicBool,
    disposed: AtomicBool,
    first_error: Mutex<Option<String>>,
    cancel: RwLock<Arc<dyn CancellationToken>>,
    suspender: Option<Arc<dyn ProgressSuspender>>,
    progress: Option<Arc<dyn ProgressReporter>>,
    file_sets: Vec<Arc<FileSet>>,
    /// Per file set: (terminal tasks so far, tasks queued for that set).
    set_progress: Vec<(AtomicUsize, usize)>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl IndexingJob {
    /// Build the queue from `file_sets`. A file listed in several sets (or twice in one) is queued
    /// once, under the first set that lists it.
    pub fn new(file_sets: Vec<Arc<FileSet>>) -> Self {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        let mut set_totals = vec![0_usize; file_sets.len()];
        for (set_index, set) in file_sets.iter().enumerate() {
            for file in &set.files {
                if seen.insert(file.id()) {
                    tasks.push(FileIndexingTask {
                        file: Arc::clone(file),
                        file_set: Arc::clone(set),
                        set_index,
                    });
                    set_totals[set_index] += 1;
                }
            }
        }

        let total = tasks.len();
        let (queue_tx, queue_rx) = bounded::<FileIndexingTask>(total.max(1));
        for task in tasks {
            // Capacity equals the task count, so this never blocks.
            let _ = queue_tx.send(task);
        }
        let (done_tx, done_rx) = bounded::<()>(1);
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "job {}: {} files across {} file sets",
            id,
            total,
            file_sets.len()
        );

        Self {
            id,
            queue_tx,
            queue_rx,
            total,
            remaining: AtomicUsize::new(total),
            in_flight: AtomicUsize::new(0),
            no_more_work: AtomicBool::new(total == 0),
            disposed: AtomicBool::new(false),
            first_error: Mutex::new(None),
            cancel: RwLock::new(Arc::new(NeverCancelled)),
            suspender: None,
            progress: None,
            file_sets,
            set_progress: set_totals
                .into_iter()
                .map(|t| (AtomicUsize::new(0), t))
                .collect(),
            done_tx,
            done_rx,
        }
    }

    pub fn with_suspender(mut self, suspender: Arc<dyn ProgressSuspender>) -> Self {
        self.suspender = Some(suspender);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Distinct files in the job.
    pub fn total_count(&self) -> usize {
        self.total
    }

    /// Tasks that have not reached a terminal state.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Tasks taken from the queue and not yet terminal or requeued.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }

    pub fn file_sets(&self) -> &[Arc<FileSet>] {
        &self.file_sets
    }

    pub fn stats(&self) -> IndexingStats {
        IndexingStats::collect(self.total, &self.file_sets)
    }

    /// Every task reached a terminal state.
    pub fn is_drained(&self) -> bool {
        self.remaining() == 0
    }

    /// The queue was found empty; remaining tasks (if any) are in flight.
    pub fn has_no_more_work(&self) -> bool {
        self.no_more_work.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Install the token for the next run. Also revives a disposed job so it can be retried.
    pub(crate) fn start_run(&self, cancel: Arc<dyn CancellationToken>) {
        *self.cancel.write().unwrap_or_else(PoisonError::into_inner) = cancel;
        self.disposed.store(false, Ordering::SeqCst);
        if !self.queue_rx.is_empty() {
            self.no_more_work.store(false, Ordering::SeqCst);
        }
    }

    pub fn cancellation(&self) -> Arc<dyn CancellationToken> {
        Arc::clone(&self.cancel.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_cancelled()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspender.as_ref().is_some_and(|s| s.is_suspended())
    }

    /// Record the job's fatal error. First write wins; later errors are only logged.
    pub fn set_error(&self, msg: String) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            None => *slot = Some(msg),
            Some(first) => debug!("job {}: ignoring error after {:?}: {}", self.id, first, msg),
        }
    }

    pub fn error(&self) -> Option<String> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_error(&self) -> bool {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Dequeue the next task, or mark the job as out of work.
    pub(crate) fn take_task(&self) -> Option<FileIndexingTask> {
        match self.queue_rx.try_recv() {
            Ok(task) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Some(task)
            }
            Err(_) => {
                self.no_more_work.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    /// Put a task back after its load was cancelled. Not a terminal state.
    pub(crate) fn requeue(&self, task: FileIndexingTask) {
        if self.queue_tx.try_send(task).is_err() {
            // Only possible if the queue holds more than `total` tasks, which accounting forbids.
            warn!("job {}: could not requeue cancelled task", self.id);
        }
        self.no_more_work.store(false, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Terminal accounting for one task: exactly one call per task taken from the queue.
    pub(crate) fn finish_task(&self, task: &FileIndexingTask) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match previous {
            Ok(1) => {
                debug!("job {}: all {} files processed", self.id, self.total);
                let _ = self.done_tx.try_send(());
            }
            Ok(_) => {}
            Err(_) => warn!("job {}: task finished after countdown reached zero", self.id),
        }
        self.report_progress(task);
    }

    fn report_progress(&self, task: &FileIndexingTask) {
        let Some((done, total)) = self.set_progress.get(task.set_index) else {
            return;
        };
        let done = done.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = &self.progress {
            let label = task.file_set.label();
            let reported =
                panic::catch_unwind(AssertUnwindSafe(|| progress.file_done(label, done, *total)));
            if reported.is_err() {
                warn!("job {}: progress reporter panicked for {}", self.id, label);
            }
        }
    }

    /// Wait up to `timeout` for the countdown to reach zero. Returns [`is_drained`](Self::is_drained).
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        if self.is_drained() {
            return true;
        }
        let _ = self.done_rx.recv_timeout(timeout);
        self.is_drained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CancelFlag, FileId, FileRef, SharedFile};
    use std::io;

    struct Named(FileId);

    impl FileRef for Named {
        fn id(&self) -> FileId {
            self.0
        }

        fn name(&self) -> String {
            format!("file{}", self.0)
        }

        fn length(&self) -> io::Result<u64> {
            Ok(1)
        }
    }

    fn set(name: &str, ids: &[FileId]) -> Arc<FileSet> {
        let files = ids
            .iter()
            .map(|&id| -> SharedFile { Arc::new(Named(id)) })
            .collect();
        Arc::new(FileSet::new(name, files))
    }

    #[test]
    fn test_queue_dedups_by_file_id() {
        let job = IndexingJob::new(vec![set("a", &[1, 2, 2]), set("b", &[2, 3])]);
        assert_eq!(job.total_count(), 3);
        assert_eq!(job.queued(), 3);
        assert_eq!(job.set_progress[0].1, 2);
        assert_eq!(job.set_progress[1].1, 1);
    }

    #[test]
    fn test_empty_job_is_drained() {
        let job = IndexingJob::new(vec![set("a", &[])]);
        assert!(job.is_drained());
        assert!(job.has_no_more_work());
        assert!(job.wait_drained(Duration::from_millis(1)));
    }

    #[test]
    fn test_requeue_is_not_terminal() {
        let job = IndexingJob::new(vec![set("a", &[1, 2])]);
        let task = job.take_task().unwrap();
        assert_eq!(job.in_flight(), 1);
        job.requeue(task);
        assert_eq!(job.in_flight(), 0);
        assert_eq!(job.remaining(), 2);
        assert_eq!(job.queued(), 2);
        assert!(!job.has_no_more_work());
    }

    #[test]
    fn test_finish_counts_down_once_per_task() {
        let job = IndexingJob::new(vec![set("a", &[1, 2])]);
        let first = job.take_task().unwrap();
        let second = job.take_task().unwrap();
        assert!(job.take_task().is_none());
        assert!(job.has_no_more_work());

        job.finish_task(&first);
        assert!(!job.wait_drained(Duration::from_millis(1)));
        job.finish_task(&second);
        assert!(job.is_drained());
        assert!(job.wait_drained(Duration::from_millis(1)));
    }

    #[test]
    fn test_first_error_is_kept() {
        let job = IndexingJob::new(vec![set("a", &[1])]);
        job.set_error("first".to_string());
        job.set_error("second".to_string());
        assert_eq!(job.error().as_deref(), Some("first"));
    }

    #[test]
    fn test_start_run_swaps_token_and_revives() {
        let job = IndexingJob::new(vec![set("a", &[1])]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        job.start_run(Arc::new(cancel));
        assert!(job.is_cancelled());
        job.dispose();

        job.start_run(Arc::new(CancelFlag::new()));
        assert!(!job.is_cancelled());
        assert!(!job.is_disposed());
    }
}
