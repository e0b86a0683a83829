//! On-disk collaborators: files as [`FileRef`]s, a reading [`ContentCache`], and directory walks
//! that turn a tree into a [`FileSet`].

use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::types::{ContentCache, FileId, FileRef, FileSet, SharedFile};

/// A regular file on disk, identified by its canonical path.
#[derive(Clone, Debug)]
pub struct DiskFile {
    id: FileId,
    path: PathBuf,
}

impl DiskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Self {
            id: hasher.finish(),
            path,
        }
    }
}

impl FileRef for DiskFile {
    fn id(&self) -> FileId {
        self.id
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn length(&self) -> io::Result<u64> {
        std::fs::metadata(&self.path).map(|m| m.len())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Reads content straight from disk, through [`FileRef::path`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskContentCache;

impl ContentCache for DiskContentCache {
    fn load(&self, file: &dyn FileRef) -> anyhow::Result<Vec<u8>> {
        let path = file
            .path()
            .ok_or_else(|| anyhow::anyhow!("{} has no path on disk", file.name()))?;
        std::fs::read(path).with_context(|| format!("read {}", path.display()))
    }
}

/// Check if a file should be excluded based on OS-specific hidden files
pub fn is_os_hidden_file(path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        match name {
            // macOS
            ".DS_Store" | ".AppleDouble" | ".LSOverride" => true,
            // Windows
            "Thumbs.db" | "ehthumbs.db" | "Desktop.ini" | "$RECYCLE.BIN" => true,
            // Linux
            ".directory" => true,
            // macOS resource forks, Linux trash dirs
            _ => name.starts_with("._") || name.starts_with(".Trash-"),
        }
    } else {
        false
    }
}

/// Simple glob pattern matching (supports * and ?)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.strip_prefix('!').unwrap_or(pattern);
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_chars(&p, &t)
}

fn glob_match_chars(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => (0..=t.len()).any(|skip| glob_match_chars(&p[1..], &t[skip..])),
        Some('?') => !t.is_empty() && glob_match_chars(&p[1..], &t[1..]),
        Some(c) => t.first() == Some(c) && glob_match_chars(&p[1..], &t[1..]),
    }
}

/// True if `path` is excluded by OS-hidden rules or any pattern (matched on name or full path).
pub fn is_excluded(path: &Path, exclude_patterns: &[String]) -> bool {
    if is_os_hidden_file(path) {
        return true;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let path_str = path.to_str().unwrap_or("");
    exclude_patterns
        .iter()
        .any(|pattern| glob_match(pattern, name) || glob_match(pattern, path_str))
}

/// Walk `root` and collect its regular files as one file set named after the directory.
/// Excluded directories are not descended into; unreadable entries are logged and skipped.
pub fn collect_file_set(root: &Path, exclude: &[String], follow_links: bool) -> Result<FileSet> {
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize {}", root.display()))?;
    let mut files: Vec<SharedFile> = Vec::new();
    let mut skipped = 0_usize;
    let walker = WalkDir::new(&root)
        .follow_links(follow_links)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_excluded(e.path(), exclude));
    for entry in walker {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    files.push(Arc::new(DiskFile::new(entry.into_path())));
                }
            }
            Err(err) => {
                warn!("Error accessing path: {}", err);
                skipped += 1;
            }
        }
    }
    debug!(
        "{}: {} files collected, {} entries skipped",
        root.display(),
        files.len(),
        skipped
    );
    let name = root.display().to_string();
    let label = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    Ok(FileSet::new(name, files).with_progress_label(label))
}
