use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Tier A: an in-memory near-cache with per-key TTL.
///
/// A plain `Mutex<HashMap<..>>` rather than a concurrent map: entries are
/// small and lookups are not expected to be a bottleneck relative to the
/// Tier B round trip they exist to avoid.
pub(super) struct TierA {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TierA {
    pub(super) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn put(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("tier A lock poisoned");
        entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub(super) fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().expect("tier A lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_value() {
        let cache = TierA::new();
        cache.put("k", serde_json::json!({"a": 1}), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn expired_entry_is_evicted() {
        let cache = TierA::new();
        cache.put("k", serde_json::json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }
}
