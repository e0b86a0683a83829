use clap::Parser;
use std::path::PathBuf;

struct DefaultArgs;

impl DefaultArgs {
    pub const DIR: &'static str = ".";
}

/// Concurrent content indexer: one file set per directory, indexed by a shared worker pool.
#[derive(Clone, Parser)]
#[command(name = "indexflow")]
#[command(about = "Index the content of one or more directories and report statistics.")]
pub struct Cli {
    /// Directories to index, one file set each. Default: current directory.
    #[arg(value_name = "DIR", default_values_t = [DefaultArgs::DIR.to_string()])]
    pub dirs: Vec<String>,

    /// Number of indexing threads. Default: cores - 1, capped by the FD limit.
    #[arg(long, short = 't')]
    pub threads: Option<usize>,

    /// Soft cap on file content held in memory, in MiB. Default: derived from system memory.
    #[arg(long, short = 'm')]
    pub memory_mb: Option<u64>,

    /// Files above this size (KiB) are recorded as too large instead of indexed.
    #[arg(long)]
    pub max_file_size_kb: Option<u64>,

    /// Number of generic writer partitions.
    #[arg(long, short = 'w')]
    pub writers: Option<usize>,

    /// Exclude patterns (glob syntax). Can specify multiple: -e pattern1 pattern2 pattern3
    #[arg(long, short = 'e', num_args = 1..)]
    pub exclude: Vec<String>,

    /// Follow symbolic links.
    #[arg(long, short = 'f', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub follow_links: Option<bool>,

    /// Verbose output (debug logs and progress bars).
    #[arg(long, short = 'v', num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub verbose: Option<bool>,

    /// Print statistics as JSON.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_parser = clap::value_parser!(bool))]
    pub json: Option<bool>,
}

impl Cli {
    pub fn dir_paths(&self) -> Vec<PathBuf> {
        self.dirs.iter().map(PathBuf::from).collect()
    }
}
