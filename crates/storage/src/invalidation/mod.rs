//! Process-wide cache invalidation.
//!
//! [`CacheInvalidator::invalidate`] clears the tenant from every router cache
//! registered in this process before it returns, then announces the event on
//! a broadcast channel so other processes can be told (see [`pg_notify`]).

pub mod pg_notify;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::broadcast;
use tracing::debug;

use crate::{cache::RouterCache, model::TenantId};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOrigin {
    /// Raised by a configuration change in this process.
    Local,
    /// Received from another process.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub tenant_id: TenantId,
    pub origin: InvalidationOrigin,
}

struct Inner {
    caches: Mutex<Vec<Weak<RouterCache>>>,
    events: broadcast::Sender<InvalidationEvent>,
}

#[derive(Clone)]
pub struct CacheInvalidator {
    inner: Arc<Inner>,
}

impl Default for CacheInvalidator {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInvalidator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                caches: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    fn caches(&self) -> MutexGuard<'_, Vec<Weak<RouterCache>>> {
        self.inner
            .caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, cache: &Arc<RouterCache>) {
        self.caches().push(Arc::downgrade(cache));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.events.subscribe()
    }

    /// Invalidate after a local configuration change. Idempotent.
    pub fn invalidate(&self, tenant_id: &TenantId) -> usize {
        self.apply(tenant_id, InvalidationOrigin::Local)
    }

    /// Invalidate on behalf of another process. Not re-published remotely.
    pub fn apply_remote(&self, tenant_id: &TenantId) -> usize {
        self.apply(tenant_id, InvalidationOrigin::Remote)
    }

    fn apply(&self, tenant_id: &TenantId, origin: InvalidationOrigin) -> usize {
        let touched = {
            let mut caches = self.caches();
            caches.retain(|cache| cache.strong_count() > 0);
            for cache in caches.iter().filter_map(Weak::upgrade) {
                cache.invalidate(tenant_id);
            }
            caches.len()
        };

        // No subscribers is fine.
        let _ = self.inner.events.send(InvalidationEvent {
            tenant_id: tenant_id.clone(),
            origin,
        });

        debug!(tenant_id = %tenant_id, ?origin, caches = touched, "Router caches invalidated");
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::memory::{MemoryDatabase, MemoryStore},
        model::StorageConfiguration,
        router::Resolution,
    };

    fn tenant() -> TenantId {
        TenantId::new("org-42").unwrap()
    }

    fn populated_cache() -> Arc<RouterCache> {
        let cache = Arc::new(RouterCache::default());
        let resolution = Resolution::new(
            StorageConfiguration::official(tenant()),
            MemoryStore::official(MemoryDatabase::new()).into_handle(),
            None,
        );
        cache.insert_if_current(&tenant(), Arc::new(resolution), 0);
        cache
    }

    #[test]
    fn test_invalidates_every_registered_cache() {
        let invalidator = CacheInvalidator::new();
        let first = populated_cache();
        let second = populated_cache();
        invalidator.register(&first);
        invalidator.register(&second);

        assert_eq!(invalidator.invalidate(&tenant()), 2);

        assert!(first.get(&tenant()).is_none());
        assert!(second.get(&tenant()).is_none());
    }

    #[test]
    fn test_dropped_caches_are_forgotten() {
        let invalidator = CacheInvalidator::new();
        let kept = populated_cache();
        invalidator.register(&kept);
        invalidator.register(&populated_cache());

        assert_eq!(invalidator.invalidate(&tenant()), 1);
    }

    #[tokio::test]
    async fn test_events_carry_origin() {
        let invalidator = CacheInvalidator::new();
        let mut events = invalidator.subscribe();

        invalidator.invalidate(&tenant());
        invalidator.apply_remote(&tenant());

        let local = events.recv().await.unwrap();
        let remote = events.recv().await.unwrap();
        assert_eq!(local.origin, InvalidationOrigin::Local);
        assert_eq!(remote.origin, InvalidationOrigin::Remote);
        assert_eq!(remote.tenant_id, tenant());
    }
}
