//! Loads file bytes under the too-large policy and the shared memory budget.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::memory_budget::MemoryBudget;
use crate::error::LoadError;
use crate::types::{CancellationToken, ContentCache, FileRef, TooLargePredicate};

/// Bytes of one file, counted against the memory budget until released or dropped.
pub struct LoadedContent {
    bytes: Vec<u8>,
    reserved: u64,
    load_time: Duration,
    budget: Arc<MemoryBudget>,
    released: bool,
}

impl LoadedContent {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length reserved in the budget (the file length read before loading).
    pub fn length(&self) -> u64 {
        self.reserved
    }

    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    /// Drop the bytes and return the reservation to the budget.
    pub fn release(mut self) {
        self.release_reservation();
    }

    fn release_reservation(&mut self) {
        if !self.released {
            self.released = true;
            self.bytes = Vec::new();
            self.budget.release(self.reserved);
        }
    }
}

impl Drop for LoadedContent {
    fn drop(&mut self) {
        self.release_reservation();
    }
}

pub struct ContentLoader {
    budget: Arc<MemoryBudget>,
    cache: Arc<dyn ContentCache>,
    too_large: TooLargePredicate,
}

impl ContentLoader {
    pub fn new(
        budget: Arc<MemoryBudget>,
        cache: Arc<dyn ContentCache>,
        too_large: TooLargePredicate,
    ) -> Self {
        Self {
            budget,
            cache,
            too_large,
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Load `file`: too-large check, length, reservation, read. On success the returned
    /// [`LoadedContent`] owns the reservation; on every failure nothing stays reserved.
    pub fn load(
        &self,
        file: &dyn FileRef,
        cancel: &dyn CancellationToken,
    ) -> Result<LoadedContent, LoadError> {
        if (self.too_large)(file) {
            return Err(LoadError::ContentTooLarge { file: file.name() });
        }
        let length = file
            .length()
            .map_err(|e| LoadError::load_failed(file.name(), e.into()))?;

        self.budget.acquire(length, cancel)?;
        let started = Instant::now();
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.cache.load(file)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("content cache panicked")));
        match loaded {
            Ok(bytes) => Ok(LoadedContent {
                bytes,
                reserved: length,
                load_time: started.elapsed(),
                budget: Arc::clone(&self.budget),
                released: false,
            }),
            Err(cause) => {
                self.budget.release(length);
                Err(LoadError::load_failed(file.name(), cause))
            }
        }
    }
}
