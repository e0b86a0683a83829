//! Process-wide soft cap on bytes of file content held in memory by indexing threads.
//!
//! `acquire` waits while usage is at or above capacity, then admits the request whole, so a single
//! oversized file may push usage past capacity. Nothing else is admitted until usage drops back
//! under capacity, bounding usage by `capacity + largest file`.

use log::{debug, error};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::Cancelled;
use crate::types::CancellationToken;
use crate::utils::config::MemoryBudgetConsts;

#[derive(Debug, Default)]
struct BudgetState {
    used: u64,
    peak: u64,
}

#[derive(Debug)]
pub struct MemoryBudget {
    capacity: u64,
    state: Mutex<BudgetState>,
    released: Condvar,
}

static GLOBAL_BUDGET: OnceLock<MemoryBudget> = OnceLock::new();

impl MemoryBudget {
    /// Budget with `capacity` bytes (at least 1).
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BudgetState::default()),
            released: Condvar::new(),
        }
    }

    /// Process-wide budget sized from system memory. Built once on first use.
    pub fn global() -> &'static MemoryBudget {
        GLOBAL_BUDGET.get_or_init(|| {
            let capacity = MemoryBudgetConsts::default_capacity();
            debug!("Global memory budget: {} bytes", capacity);
            MemoryBudget::new(capacity)
        })
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    /// Highest usage observed since creation.
    pub fn peak_bytes(&self) -> u64 {
        self.lock().peak
    }

    /// Block until usage is under capacity, then reserve `bytes`. Checks `cancel` every
    /// [`MemoryBudgetConsts::WAIT_POLL`] while waiting; a cancelled wait reserves nothing.
    pub fn acquire(&self, bytes: u64, cancel: &dyn CancellationToken) -> Result<(), Cancelled> {
        let mut state = self.lock();
        while state.used >= self.capacity {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let (guard, _timeout) = self
                .released
                .wait_timeout(state, MemoryBudgetConsts::WAIT_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        state.used += bytes;
        state.peak = state.peak.max(state.used);
        Ok(())
    }

    /// Return `bytes` reserved by an earlier [`acquire`](Self::acquire) and wake waiters once usage
    /// is back under capacity.
    pub fn release(&self, bytes: u64) {
        let mut state = self.lock();
        state.used = match state.used.checked_sub(bytes) {
            Some(used) => used,
            None => {
                error!(
                    "Memory budget released {} bytes with only {} in use",
                    bytes, state.used
                );
                0
            }
        };
        if state.used < self.capacity {
            self.released.notify_all();
        }
    }
}
