//! Query Cache — bounded-by-time, unbounded-by-size TTL map with
//! touch-on-read semantics. Used both per-backend (keyed by query) and for
//! per-document identity caching.
//!
//! Grounded on `QueryCache` in `app/specify/api.py`: a thin wrapper that
//! refreshes an entry's expiry whenever it's read so hot entries survive.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// A TTL-bounded map with touch-on-read refresh. Eviction is lazy: expired
/// entries are dropped the next time they're looked up or when a new entry
/// is inserted, matching the design's "no background eviction task" note.
#[derive(Debug)]
pub struct QueryCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, (V, Instant)>,
}

impl<K, V> Default for QueryCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        QueryCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Looks up `key`; on hit, refreshes its expiry (touch-on-read).
    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some((_, expiry)) => Instant::now() > *expiry,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.1 = now + self.ttl;
            return Some(entry.0.clone());
        }
        None
    }

    pub fn set(&mut self, key: K, value: V) {
        let expiry = Instant::now() + self.ttl;
        self.entries.insert(key, (value, expiry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_on_read_extends_expiry() {
        let mut cache: QueryCache<String, i32> = QueryCache::new(Duration::from_millis(50));
        cache.set("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        // would have expired without the touch-on-read refresh above
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn expires_after_ttl_without_reads() {
        let mut cache: QueryCache<String, i32> = QueryCache::new(Duration::from_millis(20));
        cache.set("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a".to_string()), None);
    }
}
