//! In-memory indexes built by the CLI: content hash (blake3), word -> files, and line counts.
//! Each index is mutated only from its writer partition; the mutexes are never contended.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::{ApplierBatch, FileRef, IndexFunction, IndexId, IndexWrite};
use crate::utils::config::BINARY_SNIFF_LEN;

pub const CONTENT_HASH_INDEX: &str = "content-hash";
pub const WORDS_INDEX: &str = "words";
pub const LINES_INDEX: &str = "lines";

/// Words shorter than this are not indexed.
const MIN_WORD_LEN: usize = 3;

/// Indexes that deserve a dedicated writer partition.
pub fn hot_indexes() -> Vec<String> {
    vec![CONTENT_HASH_INDEX.to_string(), WORDS_INDEX.to_string()]
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ContentIndexes {
    hashes: Mutex<HashMap<String, blake3::Hash>>,
    words: Mutex<HashMap<String, BTreeSet<String>>>,
    lines: Mutex<HashMap<String, usize>>,
}

/// Sizes of the three indexes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct IndexSummary {
    pub hashed_files: usize,
    pub distinct_words: usize,
    pub text_files: usize,
    pub total_lines: usize,
}

impl ContentIndexes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hex blake3 hash of an indexed file.
    pub fn hash_of(&self, file: &str) -> Option<String> {
        lock(&self.hashes).get(file).map(|h| h.to_hex().to_string())
    }

    /// Files containing `word` (case-insensitive), sorted.
    pub fn files_with_word(&self, word: &str) -> Vec<String> {
        lock(&self.words)
            .get(&word.to_lowercase())
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn line_count(&self, file: &str) -> Option<usize> {
        lock(&self.lines).get(file).copied()
    }

    /// Groups of files with identical content (only groups of two or more).
    pub fn duplicates(&self) -> Vec<Vec<String>> {
        let mut by_hash: HashMap<blake3::Hash, Vec<String>> = HashMap::new();
        for (file, hash) in lock(&self.hashes).iter() {
            by_hash.entry(*hash).or_default().push(file.clone());
        }
        let mut groups: Vec<Vec<String>> = by_hash
            .into_values()
            .filter(|g| g.len() > 1)
            .map(|mut g| {
                g.sort();
                g
            })
            .collect();
        groups.sort();
        groups
    }

    pub fn summary(&self) -> IndexSummary {
        let lines = lock(&self.lines);
        IndexSummary {
            hashed_files: lock(&self.hashes).len(),
            distinct_words: lock(&self.words).len(),
            text_files: lines.len(),
            total_lines: lines.values().sum(),
        }
    }
}

/// True if a NUL byte appears in the sniffed prefix.
pub fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

/// Lowercased alphanumeric words of at least `MIN_WORD_LEN` chars.
pub fn extract_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

/// [`IndexFunction`] feeding a shared [`ContentIndexes`].
pub struct ContentIndexer {
    store: Arc<ContentIndexes>,
}

impl ContentIndexer {
    pub fn new(store: Arc<ContentIndexes>) -> Self {
        Self { store }
    }
}

impl IndexFunction for ContentIndexer {
    fn index(
        &self,
        file: &dyn FileRef,
        content: &[u8],
        _file_type: &str,
    ) -> anyhow::Result<ApplierBatch> {
        let name = file.name();
        let hash = blake3::hash(content);
        let store = Arc::clone(&self.store);
        let hashed_name = name.clone();
        let mut batch = ApplierBatch::new().with_write(IndexWrite::new(
            IndexId::new(CONTENT_HASH_INDEX),
            move || {
                lock(&store.hashes).insert(hashed_name, hash);
                Ok(())
            },
        ));
        if is_binary(content) {
            return Ok(batch);
        }

        let text = String::from_utf8_lossy(content);
        let line_count = text.lines().count();
        let words = extract_words(&text);

        let store = Arc::clone(&self.store);
        let lines_name = name.clone();
        batch = batch.with_write(IndexWrite::new(IndexId::new(LINES_INDEX), move || {
            lock(&store.lines).insert(lines_name, line_count);
            Ok(())
        }));

        let store = Arc::clone(&self.store);
        batch = batch.with_write(IndexWrite::new(IndexId::new(WORDS_INDEX), move || {
            let mut index = lock(&store.words);
            for word in words {
                index.entry(word).or_default().insert(name.clone());
            }
            Ok(())
        }));
        Ok(batch)
    }
}
