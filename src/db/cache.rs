use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache is full ({0} entries)")]
    Full(usize),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Read-through cache in front of mapping lookups. Writers only ever
/// invalidate, and callers must treat every error as non-fatal.
pub trait MappingCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), CacheError>;
    fn invalidate(&self, key: &str) -> Result<(), CacheError>;
    fn stats(&self) -> CacheStats;
}

pub struct MemoryCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, (String, Instant)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl MappingCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let found = self
            .entries
            .read()
            .get(key)
            .filter(|(_, inserted)| inserted.elapsed() < self.ttl)
            .map(|(value, _)| value.clone());
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let ttl = self.ttl;
            entries.retain(|_, (_, inserted)| inserted.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                return Err(CacheError::Full(entries.len()));
            }
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now()));
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_put_hits() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.put("chat:c1", "!room:example.org").expect("put");

        assert_eq!(cache.get("chat:c1").as_deref(), Some("!room:example.org"));
        assert_eq!(cache.get("chat:c2"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = MemoryCache::new(Duration::ZERO);
        cache.put("chat:c1", "!room:example.org").expect("put");
        assert_eq!(cache.get("chat:c1"), None);
    }

    #[test]
    fn full_cache_rejects_new_keys() {
        let cache = MemoryCache::with_capacity(Duration::from_secs(60), 1);
        cache.put("a", "1").expect("first put");
        assert!(matches!(cache.put("b", "2"), Err(CacheError::Full(1))));
        cache.put("a", "3").expect("overwrite existing key");
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.put("room:!r:example.org", "c1").expect("put");
        cache.invalidate("room:!r:example.org").expect("invalidate");
        assert_eq!(cache.get("room:!r:example.org"), None);
    }
}
