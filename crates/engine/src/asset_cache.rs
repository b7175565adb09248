//! Process-wide cache of already-uploaded render-engine input assets.
//!
//! Uploading the same asset to the render engine twice wastes bandwidth and
//! GPU-adjacent disk I/O; this cache lets repeat jobs that reference the same
//! content (by hash) skip straight to the filename the engine already knows.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    endpoint: String,
    content_hash: String,
}

/// A concurrency-safe, never-expiring cache from `(engine endpoint,
/// content hash)` to the filename the engine assigned on upload.
#[derive(Debug, Default)]
pub(crate) struct AssetCache {
    entries: RwLock<HashMap<CacheKey, String>>,
}

impl AssetCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, endpoint: &str, content_hash: &str) -> Option<String> {
        let key = CacheKey {
            endpoint: endpoint.to_string(),
            content_hash: content_hash.to_string(),
        };
        self.entries.read().unwrap().get(&key).cloned()
    }

    /// Idempotent insert: the same key always maps to the first filename it
    /// was ever inserted with. Returns the filename now on record (which may
    /// differ from `filename` if another caller raced and won).
    pub(crate) fn insert(&self, endpoint: &str, content_hash: &str, filename: String) -> String {
        let key = CacheKey {
            endpoint: endpoint.to_string(),
            content_hash: content_hash.to_string(),
        };
        let mut guard = self.entries.write().unwrap();
        guard.entry(key).or_insert(filename).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = AssetCache::new();
        assert_eq!(cache.get("http://engine", "abc"), None);
        let stored = cache.insert("http://engine", "abc", "uploaded123.png".to_string());
        assert_eq!(stored, "uploaded123.png");
        assert_eq!(
            cache.get("http://engine", "abc"),
            Some("uploaded123.png".to_string())
        );
    }

    #[test]
    fn distinct_endpoints_do_not_collide() {
        let cache = AssetCache::new();
        cache.insert("http://a", "abc", "a.png".to_string());
        cache.insert("http://b", "abc", "b.png".to_string());
        assert_eq!(cache.get("http://a", "abc"), Some("a.png".to_string()));
        assert_eq!(cache.get("http://b", "abc"), Some("b.png".to_string()));
    }

    #[test]
    fn first_insert_wins_on_race() {
        let cache = AssetCache::new();
        let first = cache.insert("http://engine", "abc", "first.png".to_string());
        let second = cache.insert("http://engine", "abc", "second.png".to_string());
        assert_eq!(first, "first.png");
        assert_eq!(second, "first.png");
    }
}
