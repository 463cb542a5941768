//! Time-bounded cache of panel validation verdicts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

const TTL: Duration = Duration::from_secs(10 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry {
    validated: bool,
    inserted_at: Instant,
}

/// `H(serverId ‖ token) → (verdict, insertedAt)` with a 10 minute TTL,
/// swept once per minute.
pub struct ValidationCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a `(server, token)` pair. Tokens never enter the map
    /// in the clear.
    pub fn key(server_id: &str, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(server_id.as_bytes());
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<bool> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| now.duration_since(entry.inserted_at) < TTL)
            .map(|entry| entry.validated)
    }

    pub fn insert(&self, key: String, validated: bool) {
        self.entries.lock().insert(
            key,
            Entry {
                validated,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.inserted_at) < TTL);
    }

    /// Periodic expiry sweep, detached for the daemon's lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_per_server_and_token() {
        let a = ValidationCache::key("s1", "tok");
        let b = ValidationCache::key("s1", "other");
        let c = ValidationCache::key("s2", "tok");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn verdicts_are_returned_within_the_ttl() {
        let cache = ValidationCache::new();
        let key = ValidationCache::key("s1", "tok");

        cache.insert(key.clone(), true);
        assert_eq!(cache.get(&key), Some(true));

        cache.insert(key.clone(), false);
        assert_eq!(cache.get(&key), Some(false));
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let cache = ValidationCache::new();
        let key = ValidationCache::key("s1", "tok");
        cache.insert(key.clone(), true);

        let later = Instant::now() + TTL + Duration::from_secs(1);
        assert_eq!(cache.get_at(&key, later), None);
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let cache = ValidationCache::new();
        cache.insert("old".to_owned(), true);

        let later = Instant::now() + TTL + Duration::from_secs(1);
        cache.sweep_at(later);
        assert!(cache.entries.lock().is_empty());

        cache.insert("fresh".to_owned(), true);
        cache.sweep();
        assert_eq!(cache.entries.lock().len(), 1);
    }
}
