//! Progress bar utilities for displaying indexing status (one bar per file set).

use kdam::{Animation, Bar, BarExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::ProgressReporter;

/// Configuration for creating a progress bar
pub struct ProgressBarConfig {
    pub total: usize,
    pub desc: String,
    pub position: u16,
    pub animation: Animation,
}

impl ProgressBarConfig {
    pub fn new(total: usize, desc: impl Into<String>, position: u16) -> Self {
        Self {
            total,
            desc: desc.into(),
            position,
            animation: Animation::Classic,
        }
    }
}

/// Create a progress bar with the given configuration
pub fn create_progress_bar(config: ProgressBarConfig) -> Bar {
    kdam::tqdm!(
        total = config.total,
        desc = config.desc,
        position = config.position,
        animation = config.animation,
        unit = " files"
    )
}

/// [`ProgressReporter`] drawing one terminal bar per file set label.
#[derive(Default)]
pub struct BarReporter {
    bars: Mutex<HashMap<String, Bar>>,
}

impl BarReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Redraw every bar once more (e.g. after the run, so final counts are visible).
    pub fn refresh_all(&self) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        for bar in bars.values_mut() {
            let _ = bar.refresh();
        }
    }
}

impl ProgressReporter for BarReporter {
    fn file_done(&self, label: &str, done: usize, total: usize) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        let position = u16::try_from(bars.len()).unwrap_or(u16::MAX);
        let bar = bars
            .entry(label.to_string())
            .or_insert_with(|| create_progress_bar(ProgressBarConfig::new(total, label, position)));
        let _ = bar.update_to(done);
    }
}
