//! The bucket-location cache.
//!
//! Maps bucket names to the owning node id with a TTL. Concurrent readers
//! go through `DashMap`; an expired entry is never returned (it is removed
//! on the lookup that finds it expired). Invalidation is explicit: bucket
//! create/delete and "not my bucket" responses from peers evict the entry
//! immediately.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct CachedOwner {
    node_id: Uuid,
    expires_at: Instant,
}

/// TTL'd `bucket → owner node` map.
#[derive(Debug)]
pub struct LocationCache {
    entries: DashMap<String, CachedOwner>,
    ttl: Duration,
}

impl LocationCache {
    /// Create a cache with the given entry TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Resolve a bucket, if a live entry exists.
    #[must_use]
    pub fn lookup(&self, bucket: &str) -> Option<Uuid> {
        let entry = self.entries.get(bucket)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(bucket);
            trace!(bucket, "location cache entry expired");
            return None;
        }
        Some(entry.node_id)
    }

    /// Record the owner of a bucket.
    pub fn insert(&self, bucket: &str, node_id: Uuid) {
        self.entries.insert(
            bucket.to_owned(),
            CachedOwner {
                node_id,
                expires_at: Instant::now() + self.ttl,
            },
        );
        trace!(bucket, owner = %node_id, "location cached");
    }

    /// Drop one bucket's entry. Subsequent lookups miss immediately.
    pub fn invalidate(&self, bucket: &str) {
        if self.entries.remove(bucket).is_some() {
            trace!(bucket, "location cache entry invalidated");
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Live entries as `(bucket, owner, seconds_left)`, for the management
    /// API.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Uuid, u64)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.node_id,
                    (entry.expires_at - now).as_secs(),
                )
            })
            .collect()
    }

    /// Number of entries, including any not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_return_cached_owner_within_ttl() {
        let cache = LocationCache::new(Duration::from_secs(60));
        let owner = Uuid::new_v4();
        cache.insert("photos", owner);
        assert_eq!(cache.lookup("photos"), Some(owner));
    }

    #[test]
    fn test_should_miss_after_expiry() {
        let cache = LocationCache::new(Duration::from_millis(10));
        cache.insert("photos", Uuid::new_v4());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.lookup("photos"), None);
        // The expired entry was swept by the lookup.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_should_miss_immediately_after_invalidation() {
        let cache = LocationCache::new(Duration::from_secs(60));
        cache.insert("photos", Uuid::new_v4());
        cache.invalidate("photos");
        assert_eq!(cache.lookup("photos"), None);
    }

    #[test]
    fn test_should_replace_owner_on_reinsert() {
        let cache = LocationCache::new(Duration::from_secs(60));
        cache.insert("b", Uuid::new_v4());
        let new_owner = Uuid::new_v4();
        cache.insert("b", new_owner);
        assert_eq!(cache.lookup("b"), Some(new_owner));
    }

    #[test]
    fn test_should_snapshot_only_live_entries() {
        let cache = LocationCache::new(Duration::from_secs(60));
        cache.insert("a", Uuid::new_v4());
        cache.insert("b", Uuid::new_v4());

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|(_, _, left)| *left <= 60));

        cache.clear();
        assert!(cache.snapshot().is_empty());
    }
}
