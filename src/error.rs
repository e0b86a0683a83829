//! Typed errors at the pipeline seams. Everything above them uses `anyhow`.

use log::Level;
use std::io;
use thiserror::Error;

/// The caller's cancellation token fired while the operation was running or waiting.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("indexing cancelled")]
pub struct Cancelled;

/// Why a file could not be loaded. Decides how loudly the failure is logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadFailureKind {
    /// File vanished between scheduling and loading. Expected while the tree changes.
    Missing,
    /// Any other I/O failure (permissions, invalid handle, short read).
    Io,
    /// Anything the content cache reported that is not an I/O error.
    Other,
}

impl LoadFailureKind {
    /// Classify from the first I/O error in the chain, if any.
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<io::Error>()) {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => LoadFailureKind::Missing,
            Some(_) => LoadFailureKind::Io,
            None => LoadFailureKind::Other,
        }
    }

    pub fn log_level(&self) -> Level {
        match self {
            LoadFailureKind::Missing => Level::Debug,
            LoadFailureKind::Io => Level::Warn,
            LoadFailureKind::Other => Level::Error,
        }
    }
}

/// Outcome of a failed [`ContentLoader::load`](crate::engine::ContentLoader::load).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{file} is too large to index")]
    ContentTooLarge { file: String },

    #[error("failed to load {file}: {cause:#}")]
    LoadFailed {
        file: String,
        kind: LoadFailureKind,
        cause: anyhow::Error,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl LoadError {
    pub(crate) fn load_failed(file: String, cause: anyhow::Error) -> Self {
        LoadError::LoadFailed {
            file,
            kind: LoadFailureKind::classify(&cause),
            cause,
        }
    }
}

/// The single error an indexing run surfaces.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IndexingError {
    #[error("indexing cancelled")]
    Cancelled,

    /// First failure recorded by any worker or writer of the job.
    #[error("indexing failed: {0}")]
    JobFatal(String),

    /// Writers did not settle within the drain timeout.
    #[error("index writers did not drain: {0}")]
    DrainTimeout(String),
}

impl From<Cancelled> for IndexingError {
    fn from(_: Cancelled) -> Self {
        IndexingError::Cancelled
    }
}
