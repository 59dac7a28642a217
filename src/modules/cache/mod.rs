//! TTL-bound result cache.
//!
//! Expiry is lazy: an entry past `cached_at + ttl` reads as absent and is
//! only replaced by the next write for its key. Lock poisoning degrades to a
//! miss and is never surfaced.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::modules::clock::{Clock, chrono_duration};

/// Category-prefixed hash of a normalized query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `query` (trimmed, lowercased) plus ordered extra parameters.
    pub fn new(category: &str, query: &str, params: &[(&str, String)]) -> Self {
        let mut hasher = DefaultHasher::new();
        normalize(query).hash(&mut hasher);
        for (name, value) in params {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        Self(format!("{category}:{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.cached_at + chrono_duration(self.ttl) < now
    }
}

pub struct ResultCache<T> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<T>>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            clock,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let now = self.clock.now();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: T, ttl: Duration) {
        let entry = CacheEntry {
            value,
            cached_at: self.clock.now(),
            ttl,
        };
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key, entry);
            }
            Err(_) => log::debug!("cache lock poisoned, dropping write for {key}"),
        }
    }

    /// Stores `value` with the cache's default TTL.
    pub fn insert(&self, key: CacheKey, value: T) {
        self.put(key, value, self.default_ttl);
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Stored entries, fresh or expired.
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use chrono::TimeZone;

    fn cache() -> (ResultCache<String>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        (ResultCache::new(Duration::from_secs(3600), Arc::new(clock.clone())), clock)
    }

    #[test]
    fn entries_expire_lazily() {
        let (cache, clock) = cache();
        let key = CacheKey::new("search", "AI", &[]);
        cache.put(key.clone(), "posts".into(), Duration::from_secs(60));

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get(&key).as_deref(), Some("posts"));

        clock.advance(Duration::from_secs(2));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn keys_normalize_queries_and_separate_categories() {
        let a = CacheKey::new("search", "  Coffee ", &[("limit", "10".into())]);
        let b = CacheKey::new("search", "coffee", &[("limit", "10".into())]);
        let c = CacheKey::new("post", "coffee", &[("limit", "10".into())]);
        let d = CacheKey::new("search", "coffee", &[("limit", "20".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(c.as_str().starts_with("post:"));
    }

    #[test]
    fn invalidate_and_default_ttl() {
        let (cache, clock) = cache();
        let key = CacheKey::new("profile", "user-1", &[]);
        cache.insert(key.clone(), "profile".into());
        clock.advance(Duration::from_secs(1800));
        assert!(cache.get(&key).is_some());

        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }
}
