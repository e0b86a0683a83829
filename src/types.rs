//! Public and internal types: collaborator traits injected into the pipeline and the data that
//! flows through it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::utils::config::DEFAULT_MAX_INDEXED_FILE_SIZE;

/// Stable identity of a file; two [`FileRef`]s with the same id are the same file.
pub type FileId = u64;

/// Opaque handle to a file that can be indexed.
pub trait FileRef: Send + Sync {
    fn id(&self) -> FileId;
    /// Human-readable name used in logs and statistics.
    fn name(&self) -> String;
    /// Current length in bytes. Fails if the file vanished or cannot be inspected.
    fn length(&self) -> io::Result<u64>;
    /// Location on the local file system, for files that have one. [`name`](Self::name) is for
    /// display and may be lossy.
    fn path(&self) -> Option<&Path> {
        None
    }
}

pub type SharedFile = Arc<dyn FileRef>;

/// Source of file bytes (disk, VFS cache, ...).
pub trait ContentCache: Send + Sync {
    fn load(&self, file: &dyn FileRef) -> anyhow::Result<Vec<u8>>;
}

/// Policy deciding whether a file is too large to index. Consulted before any memory is reserved.
pub type TooLargePredicate = Arc<dyn Fn(&dyn FileRef) -> bool + Send + Sync>;

/// Too-large policy comparing the current length against `max_bytes`. Files whose length cannot be
/// read are let through so the loader classifies the failure.
pub fn too_large_over(max_bytes: u64) -> TooLargePredicate {
    Arc::new(move |file: &dyn FileRef| file.length().is_ok_and(|len| len > max_bytes))
}

/// Index-relevant classification of a file (e.g. `rs`, `text`, `binary`).
pub type FileType = String;

pub trait FileClassifier: Send + Sync {
    fn classify(&self, file: &dyn FileRef, content: &[u8]) -> FileType;
}

/// Classifies by the extension of [`FileRef::name`]; `unknown` when there is none.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtensionClassifier;

impl FileClassifier for ExtensionClassifier {
    fn classify(&self, file: &dyn FileRef, _content: &[u8]) -> FileType {
        let name = file.name();
        Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Computes the index writes for one file. Runs on an indexing thread; the returned writes run
/// later on writer threads.
pub trait IndexFunction: Send + Sync {
    fn index(
        &self,
        file: &dyn FileRef,
        content: &[u8],
        file_type: &str,
    ) -> anyhow::Result<ApplierBatch>;
}

/// Polled cancellation signal. Never blocks.
pub trait CancellationToken: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Reports whether progress of a job is currently suspended (e.g. paused by the user).
pub trait ProgressSuspender: Send + Sync {
    fn is_suspended(&self) -> bool;
}

/// Receives per-file-set progress after each file reaches a terminal state.
pub trait ProgressReporter: Send + Sync {
    fn file_done(&self, label: &str, done: usize, total: usize);
}

/// Shared boolean used as a [`CancellationToken`] or [`ProgressSuspender`].
#[derive(Clone, Debug, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Same as [`Flag::set`]; reads better on a [`CancelFlag`].
    pub fn cancel(&self) {
        self.set();
    }
}

/// Cancellation token flipped by [`CancelFlag::cancel`].
pub type CancelFlag = Flag;

/// Suspender toggled by [`SuspendFlag::set`] / [`SuspendFlag::clear`].
pub type SuspendFlag = Flag;

impl CancellationToken for Flag {
    fn is_cancelled(&self) -> bool {
        self.is_set()
    }
}

impl ProgressSuspender for Flag {
    fn is_suspended(&self) -> bool {
        self.is_set()
    }
}

/// Token that is never cancelled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancelled;

impl CancellationToken for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Identifier of one index (e.g. `words`). Writer partitions are chosen from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IndexId(String);

impl IndexId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type WriteFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// One mutation of one index, applied on that index's writer partition.
pub struct IndexWrite {
    pub index: IndexId,
    pub(crate) apply: WriteFn,
}

impl IndexWrite {
    pub fn new<F>(index: IndexId, apply: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            index,
            apply: Box::new(apply),
        }
    }
}

/// Everything the index function computed for one file: per-index writes, plus an optional hook
/// releasing whatever per-file state the indexing layer holds. The hook runs exactly once, after
/// the last write was applied or when the file fails.
#[derive(Default)]
pub struct ApplierBatch {
    pub writes: Vec<IndexWrite>,
    pub(crate) release_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl ApplierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write(mut self, write: IndexWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn on_release<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release_hook = Some(Box::new(hook));
        self
    }
}

/// Counters for one file type within a file set.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileTypeStats {
    pub files: usize,
    pub bytes: u64,
    /// From start of indexing until the last write for the file was applied.
    pub processing_time: Duration,
    pub content_load_time: Duration,
}

/// Statistics of one file set. Mutated by many workers under the file set's lock.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileSetStats {
    pub indexed: usize,
    pub too_large: Vec<String>,
    pub load_failed: usize,
    /// Files whose index function or writes failed (job-fatal).
    pub failed: usize,
    pub by_type: BTreeMap<FileType, FileTypeStats>,
}

impl FileSetStats {
    pub fn too_large_count(&self) -> usize {
        self.too_large.len()
    }

    /// Files that reached any terminal state.
    pub fn processed(&self) -> usize {
        self.indexed + self.too_large.len() + self.load_failed + self.failed
    }

    pub fn bytes(&self) -> u64 {
        self.by_type.values().map(|t| t.bytes).sum()
    }

    pub fn processing_time(&self) -> Duration {
        self.by_type.values().map(|t| t.processing_time).sum()
    }
}

/// A named group of files sharing progress label and statistics within a job.
pub struct FileSet {
    pub name: String,
    pub progress_label: Option<String>,
    pub files: Vec<SharedFile>,
    stats: Mutex<FileSetStats>,
}

impl FileSet {
    pub fn new(name: impl Into<String>, files: Vec<SharedFile>) -> Self {
        Self {
            name: name.into(),
            progress_label: None,
            files,
            stats: Mutex::new(FileSetStats::default()),
        }
    }

    pub fn with_progress_label(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }

    /// Label shown in progress output: the progress label, or the name.
    pub fn label(&self) -> &str {
        self.progress_label.as_deref().unwrap_or(&self.name)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Snapshot of the current statistics.
    pub fn stats(&self) -> FileSetStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one update under the stats lock.
    fn update_stats<R>(&self, f: impl FnOnce(&mut FileSetStats) -> R) -> R {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats)
    }

    pub(crate) fn record_indexed(
        &self,
        file_type: &str,
        bytes: u64,
        processing_time: Duration,
        content_load_time: Duration,
    ) {
        self.update_stats(|s| {
            s.indexed += 1;
            let t = s.by_type.entry(file_type.to_string()).or_default();
            t.files += 1;
            t.bytes += bytes;
            t.processing_time += processing_time;
            t.content_load_time += content_load_time;
        })
    }

    pub(crate) fn record_too_large(&self, file: String) {
        self.update_stats(|s| s.too_large.push(file))
    }

    pub(crate) fn record_load_failed(&self) {
        self.update_stats(|s| s.load_failed += 1)
    }

    pub(crate) fn record_failed(&self) {
        self.update_stats(|s| s.failed += 1)
    }
}

/// One unit of work on a job's queue. Owned by whichever worker dequeued it.
#[derive(Clone)]
pub struct FileIndexingTask {
    pub file: SharedFile,
    pub file_set: Arc<FileSet>,
    /// Position of `file_set` within its job, for progress accounting.
    pub(crate) set_index: usize,
}

/// Per-file-set summary inside [`IndexingStats`].
#[derive(Clone, Debug, Serialize)]
pub struct FileSetSummary {
    pub name: String,
    pub stats: FileSetStats,
}

/// Aggregate statistics of one indexing run. Reported even when the run failed.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IndexingStats {
    /// Distinct files the job was asked to index.
    pub attempted: usize,
    pub successful: usize,
    pub too_large: usize,
    pub load_failed: usize,
    pub failed: usize,
    pub bytes: u64,
    pub file_sets: Vec<FileSetSummary>,
}

impl IndexingStats {
    pub fn collect(attempted: usize, file_sets: &[Arc<FileSet>]) -> Self {
        let mut out = IndexingStats {
            attempted,
            ..Default::default()
        };
        for set in file_sets {
            let stats = set.stats();
            out.successful += stats.indexed;
            out.too_large += stats.too_large_count();
            out.load_failed += stats.load_failed;
            out.failed += stats.failed;
            out.bytes += stats.bytes();
            out.file_sets.push(FileSetSummary {
                name: set.name.clone(),
                stats,
            });
        }
        out
    }
}

/// Options for the CLI (and its config file).
#[derive(Clone, Debug)]
pub struct Opts {
    /// Override indexing thread count. When None, derived from cores and FD limit.
    pub indexing_threads: Option<usize>,
    /// Override memory budget capacity in bytes. When None, derived from system memory.
    pub memory_capacity: Option<u64>,
    /// Files above this many bytes are recorded as too large.
    pub max_file_size: u64,
    /// Override number of generic writer partitions.
    pub aux_partitions: Option<usize>,
    /// Exclude patterns (glob syntax, e.g. `target`, `*.log`).
    pub exclude: Vec<String>,
    /// Follow symbolic links while collecting files.
    pub follow_links: bool,
    /// Debug logging and progress bars.
    pub verbose: bool,
    /// Print statistics as JSON.
    pub json: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            indexing_threads: None,
            memory_capacity: None,
            max_file_size: DEFAULT_MAX_INDEXED_FILE_SIZE,
            aux_partitions: None,
            exclude: Vec::new(),
            follow_links: false,
            verbose: false,
            json: false,
        }
    }
}
