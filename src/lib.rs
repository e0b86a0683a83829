//! Indexflow: concurrent content-indexing pipeline.
//!
//! Many indexing jobs can run at once on one [`IndexingRuntime`]: a bounded pool of indexing
//! threads drains them round-robin, file content is loaded under a shared soft memory cap, and
//! index writes are serialized per index on a fixed set of writer threads.

pub mod engine;
pub mod error;
pub mod pipeline;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

pub use error::{Cancelled, IndexingError, LoadError, LoadFailureKind};
pub use pipeline::{IndexingJob, IndexingReport, IndexingRuntime, JobRegistry, RunMode};
pub use utils::config::PipelineConfig;

/// Result alias used by public indexflow API
pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;
