//! Pipeline components: jobs, the fair registry, indexing workers and the orchestrator.

pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod worker;

pub use job::IndexingJob;
pub use orchestrator::{IndexingReport, IndexingRuntime, IndexingRuntimeBuilder, RunMode};
pub use registry::{JobRegistry, RoundOutcome};
pub use worker::{IndexingContext, IndexingWorkerPool, process_one};
