//! Set of concurrently active jobs, scanned round-robin by every indexing worker.
//!
//! A round walks a snapshot of the registered jobs and processes at most one task per job, so a
//! small job finishes within as many rounds as it has files no matter how large its neighbours
//! are. Finished, cancelled, failed and disposed jobs are collected during the round and swept
//! after it.

use log::debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::pipeline::job::IndexingJob;
use crate::utils::config::SchedulingConsts;

/// What one scan over the registry achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Processed one task from this many jobs.
    Progressed(usize),
    /// Live jobs exist but every one of them is suspended.
    AllSuspended,
    /// No live jobs left.
    Idle,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<Vec<Arc<IndexingJob>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<IndexingJob>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, job: Arc<IndexingJob>) {
        let mut jobs = self.lock();
        if !jobs.iter().any(|j| j.id() == job.id()) {
            debug!("registry: job {} registered", job.id());
            jobs.push(job);
        }
    }

    pub fn deregister(&self, job_id: u64) {
        self.lock().retain(|j| j.id() != job_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, job_id: u64) -> bool {
        self.lock().iter().any(|j| j.id() == job_id)
    }

    /// Jobs a worker should no longer visit.
    fn is_finished(job: &IndexingJob) -> bool {
        job.is_disposed() || job.has_no_more_work() || job.is_cancelled() || job.has_error()
    }

    /// One round-robin pass: call `process` once for every live, unsuspended job.
    pub fn run_round<F>(&self, mut process: F) -> RoundOutcome
    where
        F: FnMut(&Arc<IndexingJob>),
    {
        let snapshot: Vec<Arc<IndexingJob>> = self.lock().clone();
        let mut finished = Vec::new();
        let mut processed = 0;
        let mut suspended = 0;

        for job in &snapshot {
            if Self::is_finished(job) {
                finished.push(job.id());
                continue;
            }
            if job.is_suspended() {
                suspended += 1;
                continue;
            }
            process(job);
            processed += 1;
        }

        if !finished.is_empty() {
            self.lock().retain(|j| !finished.contains(&j.id()));
        }

        if processed > 0 {
            RoundOutcome::Progressed(processed)
        } else if suspended > 0 {
            RoundOutcome::AllSuspended
        } else {
            RoundOutcome::Idle
        }
    }

    /// Worker loop: run rounds until no live job remains. Pauses briefly when every live job is
    /// suspended instead of spinning.
    pub fn run_fair<F>(&self, mut process: F)
    where
        F: FnMut(&Arc<IndexingJob>),
    {
        loop {
            match self.run_round(&mut process) {
                RoundOutcome::Progressed(_) => {}
                RoundOutcome::AllSuspended => thread::sleep(SchedulingConsts::ALL_SUSPENDED_PAUSE),
                RoundOutcome::Idle => break,
            }
        }
    }
}
