//! In-memory cache of router resolutions.
//!
//! Entries live for a short TTL so a missed invalidation can only leave a
//! tenant stale for a bounded time. Invalidations advance one cache-wide
//! generation counter; a refresh that started before an invalidation cannot
//! store its (possibly old) result afterwards. Tenants without an entry take
//! no space, whatever ids callers send.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

use crate::{model::TenantId, router::Resolution};

/// Default time a resolution may be served from cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

struct CacheEntry {
    resolution: Arc<Resolution>,
    cached_at: Instant,
    generation: u64,
}

pub struct RouterCache {
    entries: DashMap<TenantId, CacheEntry>,
    generation: AtomicU64,
    ttl: Duration,
}

impl Default for RouterCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl RouterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_capacity(256),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.cached_at.elapsed() <= self.ttl
    }

    /// Cached resolution if present and younger than the TTL.
    pub fn get(&self, tenant_id: &TenantId) -> Option<Arc<Resolution>> {
        let entry = self.entries.get(tenant_id)?;
        if self.is_fresh(&entry) {
            return Some(Arc::clone(&entry.resolution));
        }
        drop(entry);
        self.entries
            .remove_if(tenant_id, |_, entry| !self.is_fresh(entry));
        None
    }

    /// Token to hand back to [`Self::insert_if_current`] after reading the
    /// configuration.
    pub fn generation(&self, tenant_id: &TenantId) -> u64 {
        match self.entries.get(tenant_id) {
            Some(entry) => entry.generation,
            None => self.generation.load(Ordering::SeqCst),
        }
    }

    /// Store `resolution` unless the tenant may have been invalidated since
    /// `observed_generation` was read. Returns whether it was stored.
    ///
    /// Without an entry to compare against, any invalidation since the read
    /// refuses the insert; the caller re-reads.
    pub fn insert_if_current(
        &self,
        tenant_id: &TenantId,
        resolution: Arc<Resolution>,
        observed_generation: u64,
    ) -> bool {
        let entry = CacheEntry {
            resolution,
            cached_at: Instant::now(),
            generation: observed_generation,
        };
        match self.entries.entry(tenant_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation != observed_generation {
                    return false;
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                // Checked under the shard lock, so a concurrent invalidate
                // either lands first or removes what we insert.
                if self.generation.load(Ordering::SeqCst) != observed_generation {
                    return false;
                }
                vacant.insert(entry);
            }
        }
        true
    }

    /// Drop the tenant's entry and fence off refreshes already in flight.
    pub fn invalidate(&self, tenant_id: &TenantId) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(tenant_id);
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let fresh = self.is_fresh(entry);
            if !fresh {
                evicted += 1;
            }
            fresh
        });
        evicted
    }

    /// Fingerprints of self-hosted stores referenced by live entries.
    pub fn live_fingerprints(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| self.is_fresh(entry))
            .filter_map(|entry| {
                entry
                    .resolution
                    .configuration
                    .target
                    .connection()
                    .map(|connection| connection.fingerprint())
            })
            .collect()
    }

    /// Number of cached entries (for debugging/monitoring).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            ConnectionHandle,
            memory::{MemoryDatabase, MemoryStore},
        },
        model::StorageConfiguration,
    };

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn official() -> ConnectionHandle {
        MemoryStore::official(MemoryDatabase::new()).into_handle()
    }

    fn resolution(id: &str) -> Arc<Resolution> {
        Arc::new(Resolution::new(
            StorageConfiguration::official(tenant(id)),
            official(),
            None,
        ))
    }

    #[test]
    fn test_cache_set_and_get() {
        let cache = RouterCache::default();
        let generation = cache.generation(&tenant("org-1"));

        assert!(cache.insert_if_current(&tenant("org-1"), resolution("org-1"), generation));

        let cached = cache.get(&tenant("org-1")).unwrap();
        assert_eq!(cached.configuration.tenant_id, tenant("org-1"));
        assert!(cache.get(&tenant("org-2")).is_none());
    }

    #[test]
    fn test_invalidation_drops_entry_and_fences_refresh() {
        let cache = RouterCache::default();
        let observed = cache.generation(&tenant("org-1"));
        cache.insert_if_current(&tenant("org-1"), resolution("org-1"), observed);

        cache.invalidate(&tenant("org-1"));

        assert!(cache.get(&tenant("org-1")).is_none());
        assert!(
            !cache.insert_if_current(&tenant("org-1"), resolution("org-1"), observed),
            "a refresh started before invalidation must not repopulate the cache"
        );
        let current = cache.generation(&tenant("org-1"));
        assert!(cache.insert_if_current(&tenant("org-1"), resolution("org-1"), current));
    }

    #[test]
    fn test_invalidation_is_per_tenant() {
        let cache = RouterCache::default();
        cache.insert_if_current(&tenant("org-1"), resolution("org-1"), 0);
        cache.insert_if_current(&tenant("org-2"), resolution("org-2"), 0);

        cache.invalidate(&tenant("org-1"));
        cache.invalidate(&tenant("org-1"));

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&tenant("org-2")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration() {
        let cache = RouterCache::new(Duration::from_secs(5));
        cache.insert_if_current(&tenant("org-1"), resolution("org-1"), 0);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get(&tenant("org-1")).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&tenant("org-1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let cache = RouterCache::new(Duration::from_secs(5));
        cache.insert_if_current(&tenant("old"), resolution("old"), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert_if_current(&tenant("new"), resolution("new"), 0);

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&tenant("new")).is_some());
    }

    #[test]
    fn test_invalidating_unknown_tenants_allocates_nothing() {
        let cache = RouterCache::default();
        let observed = cache.generation(&tenant("org-1"));

        for i in 0..1_000 {
            cache.invalidate(&tenant(&format!("stranger-{i}")));
        }

        assert!(cache.is_empty());
        assert!(
            !cache.insert_if_current(&tenant("org-1"), resolution("org-1"), observed),
            "an insert without an entry is fenced by any later invalidation"
        );
        let current = cache.generation(&tenant("org-1"));
        assert!(cache.insert_if_current(&tenant("org-1"), resolution("org-1"), current));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_leave_the_map() {
        let cache = RouterCache::new(Duration::from_secs(5));
        for i in 0..100 {
            let id = format!("org-{i}");
            let generation = cache.generation(&tenant(&id));
            cache.insert_if_current(&tenant(&id), resolution(&id), generation);
        }
        assert_eq!(cache.len(), 100);

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(cache.get(&tenant("org-0")).is_none());
        assert_eq!(cache.evict_expired(), 99);
        assert!(cache.is_empty());
    }
}
