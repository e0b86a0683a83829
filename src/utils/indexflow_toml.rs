//! Load `.indexflow.toml` from a directory (CLI only). Library callers configure the pipeline
//! through [`PipelineConfig`](crate::utils::PipelineConfig) directly.

use serde::Deserialize;
use std::path::Path;

use crate::Opts;
use crate::utils::config::PackagePaths;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct IndexflowToml {
    #[serde(default)]
    settings: SettingsSection,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsSection {
    threads: Option<usize>,
    memory_mb: Option<u64>,
    max_file_size_kb: Option<u64>,
    writers: Option<usize>,
    exclude: Option<Vec<String>>,
    follow_links: Option<bool>,
    verbose: Option<bool>,
    json: Option<bool>,
}

/// Load the config file from `dir` if present. Returns None if missing or unreadable.
pub(crate) fn load_indexflow_toml(dir: &Path) -> Option<IndexflowToml> {
    let path = dir.join(PackagePaths::get().config_filename());
    let s = std::fs::read_to_string(&path).ok()?;
    parse_indexflow_toml(&s)
        .map_err(|e| log::warn!("{}: {}", path.display(), e))
        .ok()
}

pub(crate) fn parse_indexflow_toml(s: &str) -> Result<IndexflowToml, toml::de::Error> {
    toml::from_str(s)
}

/// Overwrite opts field from file when present.
macro_rules! apply_file_opt {
    ($idx:expr, $opts:expr, $idx_field:ident => $opts_field:ident) => {
        if let Some(v) = $idx.$idx_field {
            $opts.$opts_field = v;
        }
    };
}

/// Apply file config to opts (only fields present in the file). Call before applying CLI flags.
pub(crate) fn apply_file_to_opts(file: &IndexflowToml, opts: &mut Opts) {
    let s = &file.settings;
    if let Some(n) = s.threads {
        opts.indexing_threads = Some(n);
    }
    if let Some(mb) = s.memory_mb {
        opts.memory_capacity = Some(mb * 1024 * 1024);
    }
    if let Some(kb) = s.max_file_size_kb {
        opts.max_file_size = kb * 1024;
    }
    if let Some(n) = s.writers {
        opts.aux_partitions = Some(n);
    }
    if let Some(ref v) = s.exclude {
        opts.exclude = v.clone();
    }
    apply_file_opt!(s, opts, follow_links => follow_links);
    apply_file_opt!(s, opts, verbose => verbose);
    apply_file_opt!(s, opts, json => json);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_values_override_defaults() {
        let file = parse_indexflow_toml(
            "[settings]\nthreads = 3\nmemory_mb = 16\nmax_file_size_kb = 2\nexclude = [\"target\"]\njson = true\n",
        )
        .unwrap();
        let mut opts = Opts::default();
        apply_file_to_opts(&file, &mut opts);
        assert_eq!(opts.indexing_threads, Some(3));
        assert_eq!(opts.memory_capacity, Some(16 * 1024 * 1024));
        assert_eq!(opts.max_file_size, 2048);
        assert_eq!(opts.exclude, vec!["target".to_string()]);
        assert!(opts.json);
        assert!(!opts.follow_links);
    }

    #[test]
    fn test_empty_file_keeps_opts() {
        let file = parse_indexflow_toml("").unwrap();
        let mut opts = Opts::default();
        let before = opts.max_file_size;
        apply_file_to_opts(&file, &mut opts);
        assert_eq!(opts.max_file_size, before);
        assert_eq!(opts.indexing_threads, None);
    }
}
