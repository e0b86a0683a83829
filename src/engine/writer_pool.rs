//! Fixed set of single-threaded writer partitions. Writes to one index always land on the same
//! partition, so they apply in submission order without locking inside the index itself.
//!
//! Partition layout: one dedicated partition per "hot" index name, followed by `aux` generic
//! partitions shared by every other index (chosen by hash).

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::types::{CancellationToken, IndexId};
use crate::utils::config::{PackagePaths, WriterConsts};

/// Work executed on a writer partition. Runs to completion once started.
pub type WriteTask = Box<dyn FnOnce() + Send + 'static>;

enum PartitionMessage {
    Write(WriteTask),
    Sentinel(Sender<()>),
    Shutdown,
}

struct Partition {
    name: String,
    tx: Sender<PartitionMessage>,
    handle: Option<JoinHandle<()>>,
}

/// Layout and thresholds for a [`WriterPool`].
#[derive(Clone, Debug)]
pub struct WriterPoolConfig {
    pub hot_indexes: Vec<String>,
    pub aux_partitions: usize,
    pub writes_per_indexing_thread: usize,
    pub fail_on_drain_timeout: bool,
}

impl Default for WriterPoolConfig {
    fn default() -> Self {
        Self {
            hot_indexes: Vec::new(),
            aux_partitions: WriterConsts::AUX_PARTITIONS,
            writes_per_indexing_thread: WriterConsts::WRITES_PER_INDEXING_THREAD,
            fail_on_drain_timeout: false,
        }
    }
}

pub struct WriterPool {
    partitions: Vec<Partition>,
    hot: HashMap<String, usize>,
    aux_count: usize,
    pending: Arc<AtomicUsize>,
    sleeping: AtomicUsize,
    writes_per_indexing_thread: usize,
    fail_on_drain_timeout: bool,
}

/// Decrements the sleeping-worker counter exactly once, however the nap ends.
struct SleepingGuard<'a>(&'a AtomicUsize);

impl<'a> SleepingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SleepingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single writer loop: apply tasks in arrival order until shutdown. Never interrupted by
/// cancellation; a panicking task is logged and counted as done.
fn partition_loop(rx: Receiver<PartitionMessage>, pending: Arc<AtomicUsize>, name: String) {
    while let Ok(msg) = rx.recv() {
        match msg {
            PartitionMessage::Write(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("Writer task on partition {} panicked", name);
                }
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            PartitionMessage::Sentinel(ack) => {
                let _ = ack.send(());
            }
            PartitionMessage::Shutdown => break,
        }
    }
    debug!("writer partition {} stopped", name);
}

/// Hash an index name into one of `n_buckets` generic partitions.
fn index_bucket(index: &IndexId, n_buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    index.as_str().hash(&mut hasher);
    (hasher.finish() as usize) % n_buckets
}

impl WriterPool {
    /// Spawn one thread per hot index plus `aux_partitions` (at least 1) generic threads.
    pub fn new(config: WriterPoolConfig) -> Result<Self> {
        let aux_count = config.aux_partitions.max(1);
        let pending = Arc::new(AtomicUsize::new(0));
        let mut hot = HashMap::new();
        let mut names: Vec<String> = Vec::new();
        for index in &config.hot_indexes {
            if !hot.contains_key(index) {
                hot.insert(index.clone(), names.len());
                names.push(index.clone());
            }
        }
        names.extend((0..aux_count).map(|i| format!("aux{i}")));

        let mut partitions = Vec::with_capacity(names.len());
        for name in names {
            let (tx, rx) = unbounded::<PartitionMessage>();
            let pending_w = Arc::clone(&pending);
            let name_w = name.clone();
            let handle = thread::Builder::new()
                .name(PackagePaths::get().thread_name("writer", &name))
                .spawn(move || partition_loop(rx, pending_w, name_w))?;
            partitions.push(Partition {
                name,
                tx,
                handle: Some(handle),
            });
        }
        debug!(
            "Writer pool: {} partitions ({} hot, {} aux)",
            partitions.len(),
            hot.len(),
            aux_count
        );
        Ok(Self {
            partitions,
            hot,
            aux_count,
            pending,
            sleeping: AtomicUsize::new(0),
            writes_per_indexing_thread: config.writes_per_indexing_thread.max(1),
            fail_on_drain_timeout: config.fail_on_drain_timeout,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_name(&self, partition: usize) -> Option<&str> {
        self.partitions.get(partition).map(|p| p.name.as_str())
    }

    /// Partition owning `index`. Pure function of the index name for a given layout.
    pub fn partition_for(&self, index: &IndexId) -> usize {
        match self.hot.get(index.as_str()) {
            Some(&p) => p,
            None => self.hot.len() + index_bucket(index, self.aux_count),
        }
    }

    /// Writes submitted and not yet applied.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Indexing threads currently napping for backpressure.
    pub fn sleeping_workers(&self) -> usize {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Queue `task` on `partition`. Tasks on one partition run in submission order.
    pub fn submit(&self, partition: usize, task: WriteTask) -> Result<()> {
        let p = self
            .partitions
            .get(partition)
            .ok_or_else(|| anyhow::anyhow!("no writer partition {}", partition))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if p.tx.send(PartitionMessage::Write(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("writer partition {} is shut down", p.name);
        }
        Ok(())
    }

    /// Queue `task` on the partition owning `index`.
    pub fn submit_for(&self, index: &IndexId, task: WriteTask) -> Result<()> {
        self.submit(self.partition_for(index), task)
    }

    /// Push a sentinel through every partition and wait up to `timeout` for all of them. A timeout
    /// is an error when the pool was built with `fail_on_drain_timeout`, otherwise it is logged.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        let n = self.partitions.len();
        let (ack_tx, ack_rx) = bounded::<()>(n);
        let mut expected = 0;
        for p in &self.partitions {
            if p.tx.send(PartitionMessage::Sentinel(ack_tx.clone())).is_ok() {
                expected += 1;
            }
        }
        drop(ack_tx);

        let deadline = Instant::now() + timeout;
        let mut acked = 0;
        while acked < expected && ack_rx.recv_deadline(deadline).is_ok() {
            acked += 1;
        }
        if acked == n {
            return Ok(());
        }
        let msg = format!(
            "{} of {} writer partitions settled within {:?}; {} writes still pending",
            acked,
            n,
            timeout,
            self.pending()
        );
        if self.fail_on_drain_timeout {
            anyhow::bail!(msg);
        }
        error!("{}", msg);
        Ok(())
    }

    /// True when pending writes exceed what the awake indexing threads may queue. The threshold
    /// shrinks as more threads nap, so the pool converges instead of oscillating.
    pub fn should_sleep(&self, indexing_threads: usize) -> bool {
        let awake = indexing_threads
            .saturating_sub(self.sleeping_workers())
            .max(1);
        self.pending() > self.writes_per_indexing_thread * awake
    }

    /// Nap (growing linearly per attempt, capped) while [`should_sleep`](Self::should_sleep) holds
    /// or until `cancel` fires. Returns the number of naps taken.
    pub fn throttle(&self, indexing_threads: usize, cancel: &dyn CancellationToken) -> u32 {
        if !self.should_sleep(indexing_threads) {
            return 0;
        }
        let _sleeping = SleepingGuard::enter(&self.sleeping);
        let mut attempt = 0_u32;
        while self.should_sleep(indexing_threads) && !cancel.is_cancelled() {
            attempt += 1;
            let nap = (WriterConsts::BASE_NAP * attempt).min(WriterConsts::MAX_NAP);
            thread::sleep(nap);
        }
        if attempt > 0 {
            debug!(
                "Backpressure: napped {} times ({} writes pending)",
                attempt,
                self.pending()
            );
        }
        attempt
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        for p in &self.partitions {
            let _ = p.tx.send(PartitionMessage::Shutdown);
        }
        for p in &mut self.partitions {
            if let Some(h) = p.handle.take()
                && h.join().is_err()
            {
                error!("writer partition {} panicked", p.name);
            }
        }
    }
}
