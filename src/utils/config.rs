//! Application configuration constants.
//! Tuning and thresholds in one place, plus the [`PipelineConfig`] built from them.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    config_filename: String,
    thread_prefix: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                config_filename: format!(".{pkg}.toml"),
                thread_prefix: pkg.to_string(),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Name of the optional config file looked up in the working directory.
    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    /// Thread name for a pipeline thread, e.g. `indexflow-writer-words`.
    pub fn thread_name(&self, role: &str, id: impl std::fmt::Display) -> String {
        format!("{}-{}-{}", self.thread_prefix, role, id)
    }
}

// ---- Worker threads ----

/// Limits for the indexing worker pool.
/// Use [`WorkerThreadLimits::current()`] to fill `all_threads` from rayon; the rest are const.
#[derive(Clone, Copy, Debug)]
pub struct WorkerThreadLimits {
    /// Available threads (from rayon); set by [`WorkerThreadLimits::current()`].
    pub all_threads: usize,
    /// Minimum number of indexing threads.
    pub floor: usize,
    /// Maximum number of indexing threads regardless of core count.
    pub indexing_max: usize,
}

impl Default for WorkerThreadLimits {
    fn default() -> Self {
        Self {
            all_threads: 0, // use current() to set from rayon
            floor: Self::FLOOR_THREADS,
            indexing_max: Self::INDEXING_MAX_THREADS,
        }
    }
}

impl WorkerThreadLimits {
    pub const FLOOR_THREADS: usize = 1;
    pub const INDEXING_MAX_THREADS: usize = 8;
    /// Descriptors a loading thread may hold at once (its file plus what the content cache opens).
    pub const FDS_PER_WORKER: usize = 4;
    /// Share of the open-file soft limit the indexing pool may use.
    pub const FD_LIMIT_FRACTION: f64 = 0.5;

    /// Build limits with `all_threads` set from `rayon::current_num_threads()`.
    pub fn current() -> Self {
        Self {
            all_threads: rayon::current_num_threads(),
            ..Self::default()
        }
    }

    /// Indexing threads: all cores but one, clamped to `[floor, indexing_max]`, then capped by the FD limit.
    pub fn indexing_threads(&self) -> usize {
        let wanted = self
            .all_threads
            .saturating_sub(1)
            .clamp(self.floor, self.indexing_max);
        match Self::max_by_fd_limit() {
            Some(fd_cap) if fd_cap < wanted => {
                log::debug!("Capping indexing threads {} -> {} (FD limit)", wanted, fd_cap);
                fd_cap.max(self.floor)
            }
            _ => wanted,
        }
    }

    /// Indexing threads that fit in the usable share of the open-file limit, at least one.
    /// `None` when the process has no such limit.
    pub fn max_by_fd_limit() -> Option<usize> {
        let limit = open_files_soft_limit()?;
        let usable = (limit as f64 * Self::FD_LIMIT_FRACTION) as usize;
        Some((usable / Self::FDS_PER_WORKER).max(1))
    }
}

#[cfg(unix)]
fn open_files_soft_limit() -> Option<u64> {
    use std::mem::MaybeUninit;
    let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } != 0 {
        return None;
    }
    let cur = unsafe { rlim.assume_init() }.rlim_cur;
    if cur == libc::RLIM_INFINITY {
        return None;
    }
    u64::try_from(cur).ok()
}

#[cfg(not(unix))]
fn open_files_soft_limit() -> Option<u64> {
    None
}

// ---- Memory budget ----

/// Soft memory cap on file content held by indexing threads.
pub struct MemoryBudgetConsts;

impl MemoryBudgetConsts {
    /// Lower bound for the derived capacity (bytes). 32 MB.
    pub const MIN_CAPACITY: u64 = 32 * 1024 * 1024;
    /// Upper bound for the derived capacity (bytes). 512 MB.
    pub const MAX_CAPACITY: u64 = 512 * 1024 * 1024;
    /// Share of total system memory given to loaded content (1/N).
    pub const SYSTEM_MEMORY_DIVISOR: u64 = 16;
    /// How often a blocked acquire re-checks cancellation.
    pub const WAIT_POLL: Duration = Duration::from_millis(100);

    /// Capacity derived from total system memory, clamped to `[MIN_CAPACITY, MAX_CAPACITY]`.
    pub fn default_capacity() -> u64 {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Self::MIN_CAPACITY;
        }
        (total / Self::SYSTEM_MEMORY_DIVISOR).clamp(Self::MIN_CAPACITY, Self::MAX_CAPACITY)
    }
}

// ---- Writers ----

/// Writer pool layout and backpressure tuning.
pub struct WriterConsts;

impl WriterConsts {
    /// Generic partitions shared by every index without a dedicated one.
    pub const AUX_PARTITIONS: usize = 2;
    /// Pending writes tolerated per awake indexing thread before it naps.
    pub const WRITES_PER_INDEXING_THREAD: usize = 64;
    /// First backpressure nap; later naps grow linearly with the attempt number.
    pub const BASE_NAP: Duration = Duration::from_millis(2);
    /// Ceiling for a single backpressure nap.
    pub const MAX_NAP: Duration = Duration::from_millis(100);
    /// How long a drain waits for every partition to reach its sentinel.
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
}

// ---- Scheduling ----

/// Orchestrator and registry timings.
pub struct SchedulingConsts;

impl SchedulingConsts {
    /// Orchestrator poll interval while a job runs.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Pause when every live job is suspended (avoids a hot scan loop).
    pub const ALL_SUSPENDED_PAUSE: Duration = Duration::from_millis(50);
    /// Poll interval while waiting for in-flight tasks of an aborted job to settle.
    pub const QUIESCE_POLL: Duration = Duration::from_millis(10);
}

// ---- Content ----

/// Files larger than this are recorded as too large instead of indexed (bytes). 20 MB.
pub const DEFAULT_MAX_INDEXED_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// Files whose first bytes contain NUL within this window are treated as binary.
pub const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Full pipeline configuration. Build with [`Default`] and override fields as needed.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Number of indexing worker threads.
    pub indexing_threads: usize,
    /// Soft cap on loaded content bytes (only used when the runtime creates its own budget).
    pub memory_capacity: u64,
    /// Index names that get a dedicated writer partition each.
    pub hot_indexes: Vec<String>,
    /// Generic writer partitions for every other index.
    pub aux_partitions: usize,
    /// Backpressure threshold per awake indexing thread.
    pub writes_per_indexing_thread: usize,
    /// Drain timeout after each run.
    pub drain_timeout: Duration,
    /// Treat a drain timeout as an error instead of logging it.
    pub fail_on_drain_timeout: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            indexing_threads: WorkerThreadLimits::current().indexing_threads(),
            memory_capacity: MemoryBudgetConsts::default_capacity(),
            hot_indexes: Vec::new(),
            aux_partitions: WriterConsts::AUX_PARTITIONS,
            writes_per_indexing_thread: WriterConsts::WRITES_PER_INDEXING_THREAD,
            drain_timeout: WriterConsts::DRAIN_TIMEOUT,
            fail_on_drain_timeout: false,
        }
    }
}
