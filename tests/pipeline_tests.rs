//! Pipeline tests: jobs, fair scheduling, exactly-once accounting, failures, cancellation.

mod common;

use common::{FakeCache, FakeFile, PanickyFile, RecordingIndex, file_set, files, wait_until};
use indexflow::engine::MemoryBudget;
use indexflow::pipeline::{RoundOutcome, process_one};
use indexflow::{
    CancelFlag, ContentCache, IndexingError, IndexingJob, IndexingRuntime, JobRegistry,
    NeverCancelled, PipelineConfig, ProgressReporter, ProgressSuspender, RunMode, SuspendFlag,
    too_large_over,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn config(threads: usize) -> PipelineConfig {
    PipelineConfig {
        indexing_threads: threads,
        memory_capacity: 1024 * 1024,
        aux_partitions: 2,
        drain_timeout: Duration::from_secs(10),
        ..PipelineConfig::default()
    }
}

fn runtime(threads: usize, index: &Arc<RecordingIndex>) -> IndexingRuntime {
    runtime_with(threads, index, FakeCache::new())
}

fn runtime_with(
    threads: usize,
    index: &Arc<RecordingIndex>,
    cache: Arc<dyn ContentCache>,
) -> IndexingRuntime {
    IndexingRuntime::builder(cache, index.clone())
        .config(config(threads))
        .too_large(too_large_over(100))
        .build()
        .unwrap()
}

fn never() -> Arc<NeverCancelled> {
    Arc::new(NeverCancelled)
}

// --- basic runs ---

#[test]
fn test_index_files_skips_too_large() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let set = file_set(
        "src",
        vec![
            FakeFile::new(1, "a.rs", 10),
            FakeFile::new(2, "b.rs", 10),
            FakeFile::new(3, "huge.bin", 1000),
        ],
    );
    let report = rt.index_files(vec![Arc::clone(&set)], never(), RunMode::Pooled);

    assert!(report.is_success());
    assert_eq!(report.stats.attempted, 3);
    assert_eq!(report.stats.successful, 2);
    assert_eq!(report.stats.too_large, 1);
    assert_eq!(set.stats().too_large, vec!["huge.bin".to_string()]);
    let mut applied = index.applied();
    applied.sort();
    assert_eq!(applied, vec!["a.rs", "b.rs"]);
    assert_eq!(rt.memory_budget().used_bytes(), 0);
    assert!(rt.registry().is_empty());
}

#[test]
fn test_index_files_with_nothing_to_do_returns_immediately() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let report = rt.index_files(
        vec![file_set("empty", Vec::new()), file_set("also-empty", Vec::new())],
        never(),
        RunMode::Pooled,
    );
    assert!(report.is_success());
    assert_eq!(report.stats.attempted, 0);
    assert_eq!(report.stats.file_sets.len(), 2);
    assert_eq!(rt.live_workers(), 0);
}

#[test]
fn test_file_listed_twice_is_indexed_once() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(3, &index);
    let shared = FakeFile::new(2, "shared.rs", 5);
    let first = file_set("first", vec![FakeFile::new(1, "a.rs", 5), Arc::clone(&shared)]);
    let second = file_set(
        "second",
        vec![Arc::clone(&shared), shared, FakeFile::new(3, "c.rs", 5)],
    );
    let report = rt.index_files(
        vec![Arc::clone(&first), Arc::clone(&second)],
        never(),
        RunMode::Pooled,
    );

    assert!(report.is_success());
    assert_eq!(report.stats.attempted, 3);
    assert_eq!(report.stats.successful, 3);
    assert_eq!(index.applied().len(), 3);
    assert_eq!(first.stats().indexed, 2);
    assert_eq!(second.stats().indexed, 1);
}

#[test]
fn test_load_failures_are_skipped_not_fatal() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime_with(2, &index, FakeCache::with_broken(&["corrupt.rs"]));
    let set = file_set(
        "src",
        vec![
            FakeFile::new(1, "a.rs", 5),
            FakeFile::missing(2, "deleted.rs"),
            FakeFile::new(3, "corrupt.rs", 5),
            FakeFile::new(4, "d.rs", 5),
        ],
    );
    let report = rt.index_files(vec![set], never(), RunMode::Pooled);

    assert!(report.is_success());
    assert_eq!(report.stats.successful, 2);
    assert_eq!(report.stats.load_failed, 2);
    assert_eq!(rt.memory_budget().used_bytes(), 0);
}

#[test]
fn test_stats_grouped_by_file_type() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let set = file_set(
        "src",
        vec![
            FakeFile::new(1, "a.rs", 10),
            FakeFile::new(2, "b.RS", 20),
            FakeFile::new(3, "README.md", 7),
            FakeFile::new(4, "Makefile", 3),
        ],
    );
    let report = rt.index_files(vec![set], never(), RunMode::Pooled);

    let by_type = &report.stats.file_sets[0].stats.by_type;
    assert_eq!(by_type["rs"].files, 2);
    assert_eq!(by_type["rs"].bytes, 30);
    assert_eq!(by_type["md"].files, 1);
    assert_eq!(by_type["unknown"].files, 1);
    assert_eq!(report.stats.bytes, 40);
}

// --- exactly-once accounting ---

#[test]
fn test_every_file_reaches_exactly_one_terminal_state() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime_with(4, &index, FakeCache::with_broken(&["broken1", "broken2"]));

    let mut all = files(1, 40, "ok", 8);
    all.extend(files(100, 5, "big", 500));
    all.push(FakeFile::missing(200, "gone1"));
    all.push(FakeFile::missing(201, "gone2"));
    all.push(FakeFile::missing(202, "gone3"));
    all.push(FakeFile::new(300, "broken1", 8));
    all.push(FakeFile::new(301, "broken2", 8));
    let job = Arc::new(IndexingJob::new(vec![file_set("mixed", all)]));
    assert_eq!(job.total_count(), 50);

    let report = rt.run_job(&job, never(), RunMode::Pooled);

    assert!(report.is_success());
    assert_eq!(report.stats.successful, 40);
    assert_eq!(report.stats.too_large, 5);
    assert_eq!(report.stats.load_failed, 5);
    assert_eq!(report.stats.file_sets[0].stats.processed(), 50);
    assert_eq!(job.remaining(), 0);
    assert_eq!(job.in_flight(), 0);
    // One release hook per file whose batch was produced.
    assert_eq!(index.released(), 40);
    assert_eq!(index.applied().len(), 40);
    assert_eq!(rt.memory_budget().used_bytes(), 0);
    assert_eq!(rt.writers().pending(), 0);
}

struct RecordingProgress(Mutex<HashMap<String, Vec<(usize, usize)>>>);

impl ProgressReporter for RecordingProgress {
    fn file_done(&self, label: &str, done: usize, total: usize) {
        self.0
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push((done, total));
    }
}

#[test]
fn test_progress_reported_per_file_set() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(3, &index);
    let progress = Arc::new(RecordingProgress(Mutex::new(HashMap::new())));
    let first = files(1, 7, "a", 5);
    let second = files(100, 3, "b", 500);
    let job = Arc::new(
        IndexingJob::new(vec![
            Arc::new(indexflow::FileSet::new("/work/a", first).with_progress_label("a")),
            file_set("b", second),
        ])
        .with_progress(progress.clone()),
    );
    let report = rt.run_job(&job, never(), RunMode::Pooled);
    assert!(report.is_success());

    let seen = progress.0.lock().unwrap();
    let mut a: Vec<usize> = seen["a"].iter().map(|(d, _)| *d).collect();
    a.sort();
    assert_eq!(a, (1..=7).collect::<Vec<_>>());
    assert!(seen["a"].iter().all(|(_, t)| *t == 7));
    assert_eq!(seen["b"].len(), 3);
}

// --- failures ---

#[test]
fn test_index_function_error_is_job_fatal() {
    let index = Arc::new(RecordingIndex::new().failing(&["f2"]));
    let rt = runtime(1, &index);
    let job = Arc::new(IndexingJob::new(vec![file_set("s", files(1, 4, "f", 5))]));
    let report = rt.run_job(&job, never(), RunMode::Pooled);

    match &report.error {
        Some(IndexingError::JobFatal(msg)) => assert!(msg.contains("f2"), "{}", msg),
        other => panic!("expected JobFatal, got {:?}", other),
    }
    assert!(report.stats.failed >= 1);
    assert_eq!(job.in_flight(), 0);
    assert!(!rt.registry().contains(job.id()));
    assert_eq!(rt.memory_budget().used_bytes(), 0);
    assert!(report.into_result().is_err());
}

#[test]
fn test_first_error_wins() {
    let index = Arc::new(RecordingIndex::new().failing(&["f1", "f2", "f3"]));
    let rt = runtime(1, &index);
    let set = file_set("s", files(1, 3, "f", 5));
    let report = rt.index_files(vec![set], never(), RunMode::CallerThread);

    match report.error {
        Some(IndexingError::JobFatal(msg)) => {
            assert!(msg.contains("f1"), "{}", msg);
            assert!(!msg.contains("f2"), "{}", msg);
        }
        other => panic!("expected JobFatal, got {:?}", other),
    }
}

#[test]
fn test_panicking_index_function_is_contained() {
    let index = Arc::new(RecordingIndex::new().panicking(&["f1"]));
    let rt = runtime(2, &index);
    let report = rt.index_files(
        vec![file_set("s", files(1, 3, "f", 5))],
        never(),
        RunMode::Pooled,
    );

    match report.error {
        Some(IndexingError::JobFatal(msg)) => assert!(msg.contains("panicked"), "{}", msg),
        other => panic!("expected JobFatal, got {:?}", other),
    }
    assert_eq!(rt.memory_budget().used_bytes(), 0);

    // The pool survives the panic and serves the next job.
    let ok = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &ok);
    assert!(
        rt.index_files(vec![file_set("t", files(10, 3, "g", 5))], never(), RunMode::Pooled)
            .is_success()
    );
}

#[test]
fn test_panicking_file_ref_fails_its_task_and_job() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(1, &index);
    let job = Arc::new(IndexingJob::new(vec![file_set(
        "s",
        vec![PanickyFile::new(1, "cursed.rs")],
    )]));
    let report = rt.run_job(&job, never(), RunMode::Pooled);

    match &report.error {
        Some(IndexingError::JobFatal(msg)) => {
            assert!(msg.contains("panicked"), "{}", msg);
            assert!(msg.contains("stat exploded"), "{}", msg);
        }
        other => panic!("expected JobFatal, got {:?}", other),
    }
    assert_eq!(report.stats.failed, 1);
    assert_eq!(job.remaining(), 0);
    assert_eq!(job.in_flight(), 0);
    assert_eq!(rt.memory_budget().used_bytes(), 0);
    assert!(index.applied().is_empty());
}

#[test]
fn test_panicking_file_ref_does_not_unwind_into_caller() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(1, &index);
    let set = file_set(
        "s",
        vec![
            FakeFile::new(1, "a.rs", 5),
            PanickyFile::new(2, "cursed.rs"),
            FakeFile::new(3, "c.rs", 5),
        ],
    );
    let job = Arc::new(IndexingJob::new(vec![set]));
    let report = rt.run_job(&job, never(), RunMode::CallerThread);

    match &report.error {
        Some(IndexingError::JobFatal(msg)) => assert!(msg.contains("stat exploded"), "{}", msg),
        other => panic!("expected JobFatal, got {:?}", other),
    }
    assert_eq!(report.stats.failed, 1);
    assert_eq!(index.applied(), vec!["a.rs"]);
    assert_eq!(job.in_flight(), 0);
    assert_eq!(rt.memory_budget().used_bytes(), 0);
}

struct ExplodingProgress;

impl ProgressReporter for ExplodingProgress {
    fn file_done(&self, _label: &str, _done: usize, _total: usize) {
        panic!("terminal went away")
    }
}

#[test]
fn test_panicking_progress_reporter_does_not_stop_the_run() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let job = Arc::new(
        IndexingJob::new(vec![file_set("s", files(1, 6, "f", 5))])
            .with_progress(Arc::new(ExplodingProgress)),
    );
    let report = rt.run_job(&job, never(), RunMode::Pooled);

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.stats.successful, 6);
    assert_eq!(index.applied().len(), 6);
    assert_eq!(job.remaining(), 0);
}

#[test]
fn test_failed_write_is_job_fatal_and_still_releases() {
    let index = Arc::new(RecordingIndex::new().failing_writes(&["f2"]));
    let rt = runtime(1, &index);
    let job = Arc::new(IndexingJob::new(vec![file_set("s", files(1, 2, "f", 5))]));
    let report = rt.run_job(&job, never(), RunMode::CallerThread);

    match &report.error {
        Some(IndexingError::JobFatal(msg)) => assert!(msg.contains("disk full"), "{}", msg),
        other => panic!("expected JobFatal, got {:?}", other),
    }
    assert_eq!(report.stats.successful, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(index.released(), 2);
    assert_eq!(job.remaining(), 0);
}

// --- run modes ---

#[test]
fn test_caller_thread_mode_runs_on_calling_thread() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(4, &index);
    let report = rt.index_files(
        vec![file_set("s", files(1, 12, "f", 5))],
        never(),
        RunMode::CallerThread,
    );

    assert!(report.is_success());
    assert_eq!(report.stats.successful, 12);
    assert_eq!(rt.live_workers(), 0);
    let me = thread::current().id();
    assert!(index.threads.lock().unwrap().iter().all(|t| *t == me));
}

#[test]
fn test_suspended_job_waits_for_resume() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let suspend = SuspendFlag::new();
    suspend.set();
    let job = Arc::new(
        IndexingJob::new(vec![file_set("s", files(1, 5, "f", 5))])
            .with_suspender(Arc::new(suspend.clone())),
    );

    thread::scope(|s| {
        let run = s.spawn(|| rt.run_job(&job, never(), RunMode::Pooled));
        thread::sleep(Duration::from_millis(250));
        assert!(index.applied().is_empty());
        assert_eq!(job.remaining(), 5);
        suspend.clear();
        let report = run.join().unwrap();
        assert!(report.is_success());
        assert_eq!(report.stats.successful, 5);
    });
}

/// Suspender that panics the first time it is asked, then reports "not suspended".
struct PanicOnceSuspender(AtomicBool);

impl ProgressSuspender for PanicOnceSuspender {
    fn is_suspended(&self) -> bool {
        if !self.0.swap(true, Ordering::SeqCst) {
            panic!("suspender blew up");
        }
        false
    }
}

#[test]
fn test_dead_worker_is_replaced_and_job_completes() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(1, &index);
    let job = Arc::new(
        IndexingJob::new(vec![file_set("s", files(1, 8, "f", 5))])
            .with_suspender(Arc::new(PanicOnceSuspender(AtomicBool::new(false)))),
    );
    let report = rt.run_job(&job, never(), RunMode::Pooled);

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.stats.successful, 8);
    // The first worker died in the scheduler; a replacement finished the job.
    assert!(rt.spawned_workers() >= 2, "spawned {}", rt.spawned_workers());
    assert!(rt.live_workers() <= 1);
}

#[test]
fn test_idle_workers_exit_and_next_job_spawns_new_ones() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let first = rt.index_files(vec![file_set("a", files(1, 4, "a", 5))], never(), RunMode::Pooled);
    assert!(first.is_success());
    assert!(wait_until(WAIT, || rt.live_workers() == 0));
    let spawned = rt.spawned_workers();
    assert!(spawned >= 1);

    let second = rt.index_files(
        vec![file_set("b", files(100, 4, "b", 5))],
        never(),
        RunMode::Pooled,
    );
    assert!(second.is_success());
    assert_eq!(second.stats.successful, 4);
    assert!(rt.spawned_workers() > spawned);
}

// --- cancellation ---

#[test]
fn test_cancelled_before_start_then_retried() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(2, &index);
    let job = Arc::new(IndexingJob::new(vec![file_set("s", files(1, 6, "f", 5))]));
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = rt.run_job(&job, Arc::new(cancel), RunMode::CallerThread);
    assert!(report.is_cancelled());
    assert_eq!(report.stats.successful, 0);
    assert_eq!(job.queued(), 6);

    let report = rt.run_job(&job, Arc::new(CancelFlag::new()), RunMode::Pooled);
    assert!(report.is_success());
    assert_eq!(report.stats.successful, 6);
}

#[test]
fn test_cancel_while_waiting_for_memory_requeues_and_retry_finishes() {
    let budget = Arc::new(MemoryBudget::new(100));
    let hog = Arc::clone(&budget);
    // Indexing f4 fills the budget, so loading f5 has to wait.
    let index = Arc::new(RecordingIndex::new().with_hook(move |name| {
        if name == "f4" {
            hog.acquire(100, &NeverCancelled).unwrap();
        }
    }));
    let rt = IndexingRuntime::builder(FakeCache::new(), index.clone())
        .config(config(1))
        .memory_budget(Arc::clone(&budget))
        .too_large(too_large_over(1000))
        .build()
        .unwrap();
    let job = Arc::new(IndexingJob::new(vec![file_set("s", files(1, 5, "f", 10))]));
    let cancel = CancelFlag::new();

    thread::scope(|s| {
        let token = Arc::new(cancel.clone());
        let run = s.spawn(|| rt.run_job(&job, token, RunMode::Pooled));
        assert!(wait_until(WAIT, || {
            job.remaining() == 1 && job.in_flight() == 1 && job.queued() == 0
        }));
        assert_eq!(budget.used_bytes(), 100);

        cancel.cancel();
        let report = run.join().unwrap();
        assert!(report.is_cancelled());
        assert_eq!(report.stats.successful, 4);
    });

    assert_eq!(job.queued(), 1);
    assert_eq!(job.in_flight(), 0);
    assert_eq!(job.remaining(), 1);
    assert_eq!(index.applied(), vec!["f1", "f2", "f3", "f4"]);
    assert_eq!(budget.used_bytes(), 100);

    budget.release(100);
    let report = rt.run_job(&job, Arc::new(CancelFlag::new()), RunMode::Pooled);
    assert!(report.is_success());
    assert_eq!(report.stats.successful, 5);
    assert_eq!(job.remaining(), 0);
    assert_eq!(index.applied().len(), 5);
    assert_eq!(budget.used_bytes(), 0);
}

// --- fairness ---

#[test]
fn test_round_robin_small_job_not_starved() {
    let index = Arc::new(RecordingIndex::new());
    let rt = runtime(1, &index);
    let big = Arc::new(IndexingJob::new(vec![file_set("big", files(1, 1000, "a", 1))]));
    let small = Arc::new(IndexingJob::new(vec![file_set("small", files(5000, 10, "b", 1))]));

    let registry = JobRegistry::new();
    registry.register(big.clone());
    registry.register(small.clone());
    registry.register(small.clone());
    assert_eq!(registry.len(), 2);

    let step = |job: &Arc<IndexingJob>| process_one(rt.context(), job).unwrap();
    let mut rounds = 0;
    while small.queued() > 0 {
        assert_eq!(registry.run_round(step), RoundOutcome::Progressed(2));
        rounds += 1;
    }
    assert_eq!(rounds, 10);
    assert_eq!(big.queued(), 990);

    // The next visit finds the small queue empty; the round after that sweeps it.
    assert_eq!(registry.run_round(step), RoundOutcome::Progressed(2));
    assert!(small.has_no_more_work());
    assert_eq!(registry.run_round(step), RoundOutcome::Progressed(1));
    assert!(!registry.contains(small.id()));
    assert!(small.wait_drained(WAIT));
    assert_eq!(small.stats().successful, 10);

    big.dispose();
    assert_eq!(registry.run_round(step), RoundOutcome::Idle);
    assert!(registry.is_empty());
}

#[test]
fn test_concurrent_jobs_share_pool_fairly() {
    let index = Arc::new(RecordingIndex::new().slow(Duration::from_millis(2)));
    let rt = runtime(1, &index);
    let big = Arc::new(IndexingJob::new(vec![file_set("big", files(1, 300, "a", 1))]));

    thread::scope(|s| {
        let run_big = s.spawn(|| rt.run_job(&big, never(), RunMode::Pooled));
        assert!(wait_until(WAIT, || big.remaining() < 300));

        let report = rt.index_files(
            vec![file_set("small", files(5000, 10, "b", 1))],
            never(),
            RunMode::Pooled,
        );
        assert!(report.is_success());
        assert_eq!(report.stats.successful, 10);
        assert!(big.remaining() > 0, "small job waited for the big one");

        assert!(run_big.join().unwrap().is_success());
    });
    assert!(rt.live_workers() <= 1);
}
