//! Storage router: which physical database serves a tenant's data.
//!
//! Membership and identity always resolve to the official store without
//! consulting anything. Other categories follow the tenant's configuration,
//! read through the [`RouterCache`] and refreshed at most once at a time per
//! tenant.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    backend::{BackendError, ConnectionHandle, PoolRegistry},
    cache::RouterCache,
    config_store::{ConfigStoreError, StorageConfigStore},
    invalidation::CacheInvalidator,
    model::{EntityCategory, StorageConfiguration, TenantId},
};

/// Refreshes retried when the configuration changes underneath them.
const MAX_REFRESH_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),
    #[error("cannot open configured store: {0}")]
    Backend(#[from] BackendError),
}

/// A tenant's configuration bound to concrete handles.
pub struct Resolution {
    pub configuration: StorageConfiguration,
    official: ConnectionHandle,
    self_hosted: Option<ConnectionHandle>,
}

impl Resolution {
    pub fn new(
        configuration: StorageConfiguration,
        official: ConnectionHandle,
        self_hosted: Option<ConnectionHandle>,
    ) -> Self {
        Self {
            configuration,
            official,
            self_hosted,
        }
    }

    pub fn handle_for(&self, category: EntityCategory) -> ConnectionHandle {
        match &self.self_hosted {
            Some(handle) if self.configuration.target.routes_to_self_hosted(category) => {
                handle.clone()
            }
            _ => self.official.clone(),
        }
    }
}

pub struct StorageRouter {
    official: ConnectionHandle,
    config_store: StorageConfigStore,
    pools: PoolRegistry,
    cache: Arc<RouterCache>,
    refresh_locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl StorageRouter {
    pub fn new(
        official: ConnectionHandle,
        config_store: StorageConfigStore,
        pools: PoolRegistry,
        cache: Arc<RouterCache>,
        invalidator: &CacheInvalidator,
    ) -> Self {
        invalidator.register(&cache);
        Self {
            official,
            config_store,
            pools,
            cache,
            refresh_locks: DashMap::new(),
        }
    }

    pub fn official(&self) -> &ConnectionHandle {
        &self.official
    }

    pub fn cache(&self) -> &Arc<RouterCache> {
        &self.cache
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub async fn resolve(
        &self,
        tenant_id: &TenantId,
        category: EntityCategory,
    ) -> Result<ConnectionHandle, RouterError> {
        if category == EntityCategory::MembershipAndIdentity {
            return Ok(self.official.clone());
        }
        let resolution = self.resolution(tenant_id).await?;
        Ok(resolution.handle_for(category))
    }

    /// Current resolution for the tenant, from cache when fresh.
    pub async fn resolution(&self, tenant_id: &TenantId) -> Result<Arc<Resolution>, RouterError> {
        if let Some(resolution) = self.cache.get(tenant_id) {
            trace!(tenant_id = %tenant_id, "Router cache hit");
            return Ok(resolution);
        }

        let lock = self
            .refresh_locks
            .entry(tenant_id.clone())
            .or_default()
            .clone();
        let _refreshing = lock.lock().await;

        // Someone else may have refreshed while we waited.
        if let Some(resolution) = self.cache.get(tenant_id) {
            return Ok(resolution);
        }

        let mut attempt = 1;
        loop {
            let generation = self.cache.generation(tenant_id);
            let configuration = self.config_store.get(tenant_id).await?;
            let resolution = Arc::new(self.bind(configuration)?);

            if self
                .cache
                .insert_if_current(tenant_id, Arc::clone(&resolution), generation)
            {
                debug!(
                    tenant_id = %tenant_id,
                    mode = %resolution.configuration.mode(),
                    "Router cache refreshed"
                );
                return Ok(resolution);
            }
            if attempt >= MAX_REFRESH_ATTEMPTS {
                return Ok(resolution);
            }
            debug!(tenant_id = %tenant_id, attempt, "Configuration changed during refresh, re-reading");
            attempt += 1;
        }
    }

    /// Forget per-tenant refresh locks nobody is holding or waiting on.
    pub fn release_idle_refresh_locks(&self) -> usize {
        let mut released = 0;
        // A resolver clones the lock under the shard guard, so a count of one
        // here means no task can be about to take it.
        self.refresh_locks.retain(|_, lock| {
            let idle = Arc::strong_count(lock) == 1;
            if idle {
                released += 1;
            }
            !idle
        });
        released
    }

    pub fn refresh_lock_count(&self) -> usize {
        self.refresh_locks.len()
    }

    fn bind(&self, configuration: StorageConfiguration) -> Result<Resolution, BackendError> {
        let self_hosted = configuration
            .target
            .connection()
            .map(|connection| self.pools.get_or_open(connection))
            .transpose()?;
        Ok(Resolution::new(
            configuration,
            self.official.clone(),
            self_hosted,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::memory::{MemoryConnector, MemoryDatabase, MemoryStore},
        config_store::{ConfigurationUpdate, memory::MemoryConfigRepository},
        model::{ConnectionDetails, StorageTarget},
        test_utils::test_cipher,
    };

    struct Fixture {
        store: StorageConfigStore,
        invalidator: CacheInvalidator,
        router: StorageRouter,
    }

    fn fixture() -> Fixture {
        let store =
            StorageConfigStore::new(Arc::new(MemoryConfigRepository::new()), test_cipher());
        let invalidator = CacheInvalidator::new();
        let router = StorageRouter::new(
            MemoryStore::official(MemoryDatabase::new()).into_handle(),
            store.clone(),
            PoolRegistry::new(Arc::new(MemoryConnector::new())),
            Arc::new(RouterCache::default()),
            &invalidator,
        );
        Fixture {
            store,
            invalidator,
            router,
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("org-42").unwrap()
    }

    fn self_hosted(include_organization_metadata: bool) -> StorageTarget {
        StorageTarget::SelfHosted {
            connection: ConnectionDetails::new("memory://app:pw@local", "org42db").unwrap(),
            include_organization_metadata,
        }
    }

    async fn configure(fixture: &Fixture, target: StorageTarget) {
        fixture
            .store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target,
                    last_verified_at: None,
                },
            )
            .await
            .unwrap();
        fixture.invalidator.invalidate(&tenant());
    }

    #[tokio::test]
    async fn test_unconfigured_tenant_is_official() {
        let fixture = fixture();
        for category in EntityCategory::ALL {
            let handle = fixture.router.resolve(&tenant(), category).await.unwrap();
            assert!(handle.is_official());
        }
    }

    #[tokio::test]
    async fn test_task_data_follows_self_hosted() {
        let fixture = fixture();
        configure(&fixture, self_hosted(false)).await;

        let tasks = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        let metadata = fixture
            .router
            .resolve(&tenant(), EntityCategory::OrganizationMetadata)
            .await
            .unwrap();
        let members = fixture
            .router
            .resolve(&tenant(), EntityCategory::MembershipAndIdentity)
            .await
            .unwrap();

        assert!(!tasks.is_official());
        assert!(metadata.is_official());
        assert!(members.is_official());
    }

    #[tokio::test]
    async fn test_metadata_flag_moves_metadata_only() {
        let fixture = fixture();
        configure(&fixture, self_hosted(true)).await;

        let metadata = fixture
            .router
            .resolve(&tenant(), EntityCategory::OrganizationMetadata)
            .await
            .unwrap();
        let members = fixture
            .router
            .resolve(&tenant(), EntityCategory::MembershipAndIdentity)
            .await
            .unwrap();

        assert!(!metadata.is_official());
        assert!(members.is_official());
    }

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let fixture = fixture();
        fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();

        // Written without invalidating: the cached resolution still answers.
        fixture
            .store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target: self_hosted(false),
                    last_verified_at: None,
                },
            )
            .await
            .unwrap();
        let stale = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        assert!(stale.is_official());

        fixture.invalidator.invalidate(&tenant());
        let fresh = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        assert!(!fresh.is_official());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_bounds_missed_invalidation() {
        let fixture = fixture();
        fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        fixture
            .store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target: self_hosted(false),
                    last_verified_at: None,
                },
            )
            .await
            .unwrap();

        tokio::time::advance(fixture.router.cache().ttl() + std::time::Duration::from_millis(1))
            .await;

        let handle = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        assert!(!handle.is_official());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_tenant_state_is_reclaimed() {
        let fixture = fixture();
        for i in 0..500 {
            let tenant_id = TenantId::new(format!("org-{i}")).unwrap();
            fixture
                .router
                .resolve(&tenant_id, EntityCategory::TaskData)
                .await
                .unwrap();
        }
        assert_eq!(fixture.router.cache().len(), 500);
        assert_eq!(fixture.router.refresh_lock_count(), 500);

        tokio::time::advance(fixture.router.cache().ttl() + std::time::Duration::from_secs(1))
            .await;

        assert_eq!(fixture.router.cache().evict_expired(), 500);
        assert_eq!(fixture.router.release_idle_refresh_locks(), 500);
        assert!(fixture.router.cache().is_empty());
        assert_eq!(fixture.router.refresh_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_self_hosted_pool_is_shared() {
        let fixture = fixture();
        configure(&fixture, self_hosted(false)).await;

        let first = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        fixture.invalidator.invalidate(&tenant());
        let second = fixture
            .router
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();

        assert!(first.same_store(&second));
        assert_eq!(fixture.router.pools().len(), 1);
    }
}
