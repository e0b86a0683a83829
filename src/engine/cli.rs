//! CLI command handler: collect one file set per directory, index them as one job, print stats.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::engine::arg_parser::Cli;
use crate::engine::content_index::{ContentIndexer, ContentIndexes, IndexSummary, hot_indexes};
use crate::engine::disk::{DiskContentCache, collect_file_set};
use crate::engine::progress::BarReporter;
use crate::pipeline::{IndexingJob, IndexingRuntime, RunMode};
use crate::utils::config::PipelineConfig;
use crate::utils::indexflow_toml::{apply_file_to_opts, load_indexflow_toml};
use crate::utils::setup_logging;
use crate::{CancelFlag, IndexingStats, Opts, too_large_over};

/// Opts from defaults, then `.indexflow.toml` in the working directory, then CLI flags.
fn setup_opts(cli: &Cli) -> Opts {
    let mut opts = Opts::default();
    if let Some(file) = load_indexflow_toml(Path::new(".")) {
        apply_file_to_opts(&file, &mut opts);
    }
    if let Some(n) = cli.threads {
        opts.indexing_threads = Some(n);
    }
    if let Some(mb) = cli.memory_mb {
        opts.memory_capacity = Some(mb * 1024 * 1024);
    }
    if let Some(kb) = cli.max_file_size_kb {
        opts.max_file_size = kb * 1024;
    }
    if let Some(n) = cli.writers {
        opts.aux_partitions = Some(n);
    }
    if !cli.exclude.is_empty() {
        opts.exclude = cli.exclude.clone();
    }
    if let Some(v) = cli.follow_links {
        opts.follow_links = v;
    }
    if let Some(v) = cli.verbose {
        opts.verbose = v;
    }
    if let Some(v) = cli.json {
        opts.json = v;
    }
    opts
}

/// Pipeline config for the CLI: opts override the derived defaults; content-hash and words get
/// dedicated writers.
fn pipeline_config(opts: &Opts) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        indexing_threads: opts.indexing_threads.unwrap_or(defaults.indexing_threads),
        memory_capacity: opts.memory_capacity.unwrap_or(defaults.memory_capacity),
        hot_indexes: hot_indexes(),
        aux_partitions: opts.aux_partitions.unwrap_or(defaults.aux_partitions),
        ..defaults
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    stats: &'a IndexingStats,
    indexes: IndexSummary,
    duplicates: Vec<Vec<String>>,
}

fn print_text_summary(stats: &IndexingStats, store: &ContentIndexes) {
    let indexes = store.summary();
    println!(
        "files: {} attempted, {} indexed, {} too large, {} failed to load, {} failed",
        stats.attempted, stats.successful, stats.too_large, stats.load_failed, stats.failed
    );
    println!("bytes indexed: {}", stats.bytes);
    for set in &stats.file_sets {
        println!(
            "  {}: {} indexed in {:?}",
            set.name,
            set.stats.indexed,
            set.stats.processing_time()
        );
        for (file_type, t) in &set.stats.by_type {
            debug!(
                "    {}: {} files, {} bytes, load {:?}",
                file_type, t.files, t.bytes, t.content_load_time
            );
        }
    }
    println!(
        "indexes: {} hashed, {} text files ({} lines), {} distinct words",
        indexes.hashed_files, indexes.text_files, indexes.total_lines, indexes.distinct_words
    );
    let duplicates = store.duplicates();
    if !duplicates.is_empty() {
        println!("{} groups of identical files", duplicates.len());
    }
}

/// Index every directory given on the command line. Ctrl+C cancels cooperatively.
pub fn handle_run(cli: &Cli) -> Result<()> {
    let opts = setup_opts(cli);
    setup_logging(opts.verbose);

    let cancel = CancelFlag::new();
    let cancel_handler = cancel.clone();
    ctrlc::set_handler(move || cancel_handler.cancel()).context("set Ctrl+C handler")?;

    let mut file_sets = Vec::new();
    for dir in cli.dir_paths() {
        file_sets.push(Arc::new(collect_file_set(
            &dir,
            &opts.exclude,
            opts.follow_links,
        )?));
    }

    let store = ContentIndexes::new();
    let runtime = IndexingRuntime::builder(
        Arc::new(DiskContentCache),
        Arc::new(ContentIndexer::new(Arc::clone(&store))),
    )
    .config(pipeline_config(&opts))
    .too_large(too_large_over(opts.max_file_size))
    .build()?;

    let mut job = IndexingJob::new(file_sets);
    let bars = opts.verbose.then(BarReporter::new);
    if let Some(bars) = &bars {
        job = job.with_progress(bars.clone());
    }
    let job = Arc::new(job);
    let report = runtime.run_job(&job, Arc::new(cancel), RunMode::Pooled);
    if let Some(bars) = &bars {
        bars.refresh_all();
        eprintln!();
    }

    if opts.json {
        let summary = RunSummary {
            stats: &report.stats,
            indexes: store.summary(),
            duplicates: store.duplicates(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_text_summary(&report.stats, &store);
    }

    if report.is_cancelled() {
        warn!("Indexing cancelled by user; {} files left", job.remaining());
    }
    report.into_result().map(|_| ())
}
