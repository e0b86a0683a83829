//! In-memory fakes for the pipeline's collaborators.

#![allow(dead_code)]

use indexflow::{
    ApplierBatch, CancellationToken, ContentCache, FileRef, FileSet, IndexFunction, IndexId,
    IndexWrite, SharedFile,
};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// File with a fixed name and length. `missing` files fail `length()` with NotFound.
pub struct FakeFile {
    pub id: u64,
    pub name: String,
    pub len: u64,
    pub missing: bool,
}

impl FakeFile {
    pub fn new(id: u64, name: &str, len: u64) -> SharedFile {
        Arc::new(Self {
            id,
            name: name.to_string(),
            len,
            missing: false,
        })
    }

    pub fn missing(id: u64, name: &str) -> SharedFile {
        Arc::new(Self {
            id,
            name: name.to_string(),
            len: 0,
            missing: true,
        })
    }
}

impl FileRef for FakeFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn length(&self) -> io::Result<u64> {
        if self.missing {
            Err(io::Error::new(io::ErrorKind::NotFound, "file vanished"))
        } else {
            Ok(self.len)
        }
    }
}

/// File whose `length()` panics, standing in for a broken `FileRef` implementation.
pub struct PanickyFile {
    pub id: u64,
    pub name: String,
}

impl PanickyFile {
    pub fn new(id: u64, name: &str) -> SharedFile {
        Arc::new(Self {
            id,
            name: name.to_string(),
        })
    }
}

impl FileRef for PanickyFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn length(&self) -> io::Result<u64> {
        panic!("stat exploded")
    }
}

/// Returns `len` bytes of `x` for every file, except names listed in `broken`.
#[derive(Default)]
pub struct FakeCache {
    pub broken: HashSet<String>,
    pub loads: AtomicUsize,
}

impl FakeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_broken(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            broken: names.iter().map(|s| s.to_string()).collect(),
            loads: AtomicUsize::new(0),
        })
    }
}

impl ContentCache for FakeCache {
    fn load(&self, file: &dyn FileRef) -> anyhow::Result<Vec<u8>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let name = file.name();
        if self.broken.contains(&name) {
            anyhow::bail!("cache entry for {} is corrupt", name);
        }
        let len = file.length()? as usize;
        Ok(vec![b'x'; len])
    }
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

/// Index function writing the file name into one index (`names`), recording which thread
/// computed it and how many release hooks ran.
#[derive(Default)]
pub struct RecordingIndex {
    pub applied: Arc<Mutex<Vec<String>>>,
    pub released: Arc<AtomicUsize>,
    pub threads: Mutex<Vec<ThreadId>>,
    pub fail_on: HashSet<String>,
    pub panic_on: HashSet<String>,
    pub fail_write_on: HashSet<String>,
    pub delay: Option<Duration>,
    pub hook: Option<Hook>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, names: &[&str]) -> Self {
        self.fail_on = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn panicking(mut self, names: &[&str]) -> Self {
        self.panic_on = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_writes(mut self, names: &[&str]) -> Self {
        self.fail_write_on = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl IndexFunction for RecordingIndex {
    fn index(
        &self,
        file: &dyn FileRef,
        _content: &[u8],
        _file_type: &str,
    ) -> anyhow::Result<ApplierBatch> {
        let name = file.name();
        self.threads.lock().unwrap().push(thread::current().id());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(hook) = &self.hook {
            hook(&name);
        }
        if self.panic_on.contains(&name) {
            panic!("index function exploded on {}", name);
        }
        if self.fail_on.contains(&name) {
            anyhow::bail!("cannot index {}", name);
        }
        let applied = Arc::clone(&self.applied);
        let released = Arc::clone(&self.released);
        let fail_write = self.fail_write_on.contains(&name);
        Ok(ApplierBatch::new()
            .with_write(IndexWrite::new(IndexId::new("names"), move || {
                if fail_write {
                    anyhow::bail!("disk full");
                }
                applied.lock().unwrap().push(name);
                Ok(())
            }))
            .on_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
    }
}

/// Files `f1..=fn` of `len` bytes each, with ids starting at `first_id`.
pub fn files(first_id: u64, n: usize, prefix: &str, len: u64) -> Vec<SharedFile> {
    (0..n)
        .map(|i| FakeFile::new(first_id + i as u64, &format!("{}{}", prefix, i + 1), len))
        .collect()
}

pub fn file_set(name: &str, files: Vec<SharedFile>) -> Arc<FileSet> {
    Arc::new(FileSet::new(name, files))
}

/// Poll `cond` every few ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Cancellation token that fires once `n` polls happened.
pub struct CancelAfterPolls {
    pub polls: AtomicUsize,
    pub n: usize,
}

impl CancellationToken for CancelAfterPolls {
    fn is_cancelled(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst) >= self.n
    }
}
