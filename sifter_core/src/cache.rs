use crate::testcase::ContentHash;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A remembered verdict for one candidate content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Whether the candidate was interesting.
    pub verdict: bool,
    /// Artifact prefix of the evaluation that produced the verdict.
    /// Artifacts under this prefix are replayed on a cache hit.
    pub artifact_prefix: PathBuf,
}

impl CacheEntry {
    pub fn new(verdict: bool, artifact_prefix: &Path) -> Self {
        Self {
            verdict,
            artifact_prefix: artifact_prefix.to_path_buf(),
        }
    }
}

/// Maps candidate content to the verdict it produced.
///
/// The oracle only talks to the cache through this trait so bounded or
/// persistent implementations can replace the default without touching the
/// evaluation loop.
///
/// Implementations are not required to be thread-safe; the oracle never
/// runs two evaluations at once.
pub trait ResultCache: Send {
    /// Returns the entry stored for `key`, if any.
    fn get(&self, key: &ContentHash) -> Option<&CacheEntry>;

    /// Stores `entry` under `key`. A later write for the same key replaces
    /// the earlier one.
    fn insert(&mut self, key: ContentHash, entry: CacheEntry);

    /// Drops every entry.
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unbounded in-memory cache. Lives as long as the oracle's session.
#[derive(Debug, Default)]
pub struct InMemoryResultCache {
    entries: HashMap<ContentHash, CacheEntry>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl ResultCache for InMemoryResultCache {
    fn get(&self, key: &ContentHash) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: ContentHash, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
