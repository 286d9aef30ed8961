use crate::models::CommandResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Deterministic cache key for an argument vector.
///
/// The JSON array form keeps argument boundaries, so `["a b"]` and
/// `["a", "b"]` never collide.
pub fn fingerprint(args: &[String]) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| args.join("\u{1f}"))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: Arc<CommandResult>,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.stored_at
    }
}

/// Last successful result per fingerprint.
///
/// Entries are swapped whole under the write lock, so a reader sees either
/// the previous or the next result and never a mix of both.
///
/// Every [`ResultCache::clear`] starts a new generation. Results of runs that
/// began in an older generation are refused by [`ResultCache::put_if_current`].
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    generation: Arc<AtomicU64>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<CommandResult>> {
        self.entry(fingerprint).map(|entry| entry.result)
    }

    pub fn entry(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Last writer wins. Returns false when the result is not cacheable.
    pub fn put(&self, fingerprint: &str, result: CommandResult) -> bool {
        self.store(fingerprint, result, None)
    }

    /// Like [`ResultCache::put`], but drops the result when the cache was
    /// cleared after `generation` was read.
    pub fn put_if_current(&self, fingerprint: &str, result: CommandResult, generation: u64) -> bool {
        self.store(fingerprint, result, Some(generation))
    }

    fn store(&self, fingerprint: &str, result: CommandResult, generation: Option<u64>) -> bool {
        if !result.is_cacheable() {
            tracing::debug!(fingerprint, invocation = %result.id, "skipping cache for empty result");
            return false;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = generation {
            if started != self.generation() {
                tracing::debug!(fingerprint, invocation = %result.id, "cache cleared while running, result dropped");
                return false;
            }
        }
        let entry = CacheEntry {
            result: Arc::new(result),
            stored_at: Utc::now(),
        };
        entries.insert(fingerprint.to_string(), entry);
        true
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let count = entries.len();
        entries.clear();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(count, generation, "result cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
