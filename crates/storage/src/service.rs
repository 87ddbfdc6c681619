//! Entry point tying the components together.
//!
//! [`StorageService`] owns one router, one guard and one prober for the
//! process. Clones are cheap and share everything.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ts_rs::TS;

use crate::{
    backend::{BackendConnector, ConnectionHandle, PoolRegistry},
    cache::{DEFAULT_CACHE_TTL, RouterCache},
    config_store::{ConfigRepository, StorageConfigStore},
    crypto::SecretCipher,
    error::StorageError,
    guard::{MigrationGuard, MigrationOutcome, ModeChangeRequest},
    invalidation::CacheInvalidator,
    model::{
        ConnectionDetails, EntityCategory, StorageConfiguration, StorageConfigurationView,
        TenantId,
    },
    probe::{ConnectionProbeResult, ConnectionProber, DEFAULT_PROBE_TIMEOUT},
    router::StorageRouter,
    schema::{DEFAULT_INIT_TIMEOUT, InitializationReport, SchemaInitializer, collections_for},
};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub cache_ttl: Duration,
    pub probe_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Live view of one category for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CategoryStatus {
    pub category: EntityCategory,
    pub location: String,
    /// Tenant rows per collection; `None` when the count failed.
    pub counts: BTreeMap<String, Option<u64>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StorageStatus {
    pub configuration: StorageConfigurationView,
    pub categories: Vec<CategoryStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub entries_evicted: usize,
    pub pools_released: usize,
    pub locks_released: usize,
}

#[derive(Clone)]
pub struct StorageService {
    config_store: StorageConfigStore,
    router: Arc<StorageRouter>,
    guard: MigrationGuard,
    prober: ConnectionProber,
    invalidator: CacheInvalidator,
    count_timeout: Duration,
}

impl StorageService {
    pub fn new(
        official: ConnectionHandle,
        repository: Arc<dyn ConfigRepository>,
        cipher: SecretCipher,
        connector: Arc<dyn BackendConnector>,
        invalidator: CacheInvalidator,
        settings: ServiceSettings,
    ) -> Self {
        let config_store = StorageConfigStore::new(repository, cipher);
        let router = Arc::new(StorageRouter::new(
            official,
            config_store.clone(),
            PoolRegistry::new(Arc::clone(&connector)),
            Arc::new(RouterCache::new(settings.cache_ttl)),
            &invalidator,
        ));
        let prober = ConnectionProber::new(connector, settings.probe_timeout);
        let guard = MigrationGuard::new(
            config_store.clone(),
            Arc::clone(&router),
            invalidator.clone(),
            prober.clone(),
            SchemaInitializer::new(settings.init_timeout),
            settings.probe_timeout,
        );

        Self {
            config_store,
            router,
            guard,
            prober,
            invalidator,
            count_timeout: settings.probe_timeout,
        }
    }

    pub fn router(&self) -> &Arc<StorageRouter> {
        &self.router
    }

    pub fn invalidator(&self) -> &CacheInvalidator {
        &self.invalidator
    }

    pub async fn test_connection(&self, connection: &ConnectionDetails) -> ConnectionProbeResult {
        self.prober.probe(connection).await
    }

    pub async fn configure(
        &self,
        request: ModeChangeRequest,
    ) -> Result<MigrationOutcome, StorageError> {
        self.guard.change_mode(request).await
    }

    pub async fn initialize(
        &self,
        tenant_id: &TenantId,
        connection: &ConnectionDetails,
    ) -> Result<InitializationReport, StorageError> {
        self.guard.initialize(tenant_id, connection).await
    }

    pub fn invalidate_cache(&self, tenant_id: &TenantId) -> usize {
        self.invalidator.invalidate(tenant_id)
    }

    pub async fn configuration(
        &self,
        tenant_id: &TenantId,
    ) -> Result<StorageConfiguration, StorageError> {
        Ok(self.config_store.get(tenant_id).await?)
    }

    pub async fn resolve(
        &self,
        tenant_id: &TenantId,
        category: EntityCategory,
    ) -> Result<ConnectionHandle, StorageError> {
        Ok(self.router.resolve(tenant_id, category).await?)
    }

    /// Current configuration plus live per-category counts read through the router.
    pub async fn status(&self, tenant_id: &TenantId) -> Result<StorageStatus, StorageError> {
        let resolution = self.router.resolution(tenant_id).await?;

        let mut categories = Vec::with_capacity(EntityCategory::ALL.len());
        for category in EntityCategory::ALL {
            let store = resolution.handle_for(category);
            let mut status = CategoryStatus {
                category,
                location: store.location().to_string(),
                counts: BTreeMap::new(),
                error: None,
            };
            for collection in collections_for(category) {
                let count = tokio::time::timeout(
                    self.count_timeout,
                    store.count_for_tenant(collection, tenant_id),
                )
                .await;
                let count = match count {
                    Ok(Ok(count)) => Some(count),
                    Ok(Err(e)) => {
                        status.error.get_or_insert_with(|| e.to_string());
                        None
                    }
                    Err(_) => {
                        status.error.get_or_insert_with(|| {
                            format!("no response within {}s", self.count_timeout.as_secs())
                        });
                        None
                    }
                };
                status.counts.insert(collection.name.to_string(), count);
            }
            categories.push(status);
        }

        Ok(StorageStatus {
            configuration: resolution.configuration.view(),
            categories,
        })
    }

    /// Drop expired cache entries and the pools nothing refers to anymore.
    pub fn sweep(&self) -> SweepReport {
        let entries_evicted = self.router.cache().evict_expired();
        let live = self.router.cache().live_fingerprints();
        let pools_released = self.router.pools().retain_live(&live);
        if pools_released > 0 {
            info!(pools_released, "Released idle self-hosted pools");
        }
        let locks_released = self.router.release_idle_refresh_locks();
        debug!(
            entries_evicted,
            locks_released,
            live_pools = live.len(),
            "Router sweep finished"
        );
        SweepReport {
            entries_evicted,
            pools_released,
            locks_released,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::memory::{MemoryConnector, MemoryDatabase, MemoryStore},
        config_store::memory::MemoryConfigRepository,
        model::{StorageMode, StorageTarget},
        test_utils::test_cipher,
    };

    fn service(official: &MemoryDatabase, connector: &MemoryConnector) -> StorageService {
        StorageService::new(
            MemoryStore::official(official.clone()).into_handle(),
            Arc::new(MemoryConfigRepository::new()),
            test_cipher(),
            Arc::new(connector.clone()),
            CacheInvalidator::new(),
            ServiceSettings::default(),
        )
    }

    fn tenant() -> TenantId {
        TenantId::new("org-42").unwrap()
    }

    fn connection() -> ConnectionDetails {
        ConnectionDetails::new("memory://app:pw@local", "org42db").unwrap()
    }

    #[tokio::test]
    async fn test_status_counts_through_router() {
        let official = MemoryDatabase::new();
        let connector = MemoryConnector::new();
        official.insert_rows("organization_members", Some("org-42"), 2);
        connector.database("org42db").insert_rows("tasks", Some("org-42"), 5);
        let service = service(&official, &connector);

        service
            .configure(ModeChangeRequest {
                tenant_id: tenant(),
                target: StorageTarget::SelfHosted {
                    connection: connection(),
                    include_organization_metadata: false,
                },
                confirm_destructive: false,
                initialize_schema: false,
            })
            .await
            .unwrap();

        let status = service.status(&tenant()).await.unwrap();
        assert_eq!(status.configuration.mode, StorageMode::SelfHosted);

        let members = &status.categories[0];
        assert_eq!(members.category, EntityCategory::MembershipAndIdentity);
        assert_eq!(members.location, "official");
        assert_eq!(members.counts.get("organization_members"), Some(&Some(2)));

        let tasks = &status.categories[1];
        assert_eq!(tasks.location, "self-hosted:org42db");
        assert_eq!(tasks.counts.get("tasks"), Some(&Some(5)));
    }

    #[tokio::test]
    async fn test_status_reports_unreachable_store() {
        let official = MemoryDatabase::new();
        let connector = MemoryConnector::new();
        let service = service(&official, &connector);
        service
            .configure(ModeChangeRequest {
                tenant_id: tenant(),
                target: StorageTarget::SelfHosted {
                    connection: connection(),
                    include_organization_metadata: false,
                },
                confirm_destructive: false,
                initialize_schema: false,
            })
            .await
            .unwrap();
        connector.database("org42db").set_unreachable(true);

        let status = service.status(&tenant()).await.unwrap();

        let tasks = &status.categories[1];
        assert_eq!(tasks.counts.get("tasks"), Some(&None));
        assert!(tasks.error.as_deref().unwrap().contains("network"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_unused_pools() {
        let official = MemoryDatabase::new();
        let connector = MemoryConnector::new();
        let service = service(&official, &connector);
        service
            .configure(ModeChangeRequest {
                tenant_id: tenant(),
                target: StorageTarget::SelfHosted {
                    connection: connection(),
                    include_organization_metadata: false,
                },
                confirm_destructive: false,
                initialize_schema: false,
            })
            .await
            .unwrap();
        service
            .resolve(&tenant(), EntityCategory::TaskData)
            .await
            .unwrap();
        assert_eq!(service.router().pools().len(), 1);

        assert_eq!(
            service.sweep(),
            SweepReport {
                locks_released: 1,
                ..SweepReport::default()
            }
        );

        tokio::time::advance(DEFAULT_CACHE_TTL + Duration::from_secs(1)).await;
        let report = service.sweep();
        assert_eq!(report.entries_evicted, 1);
        assert_eq!(report.pools_released, 1);
        assert!(service.router().pools().is_empty());
        assert!(service.router().cache().is_empty());
        assert_eq!(service.router().refresh_lock_count(), 0);
    }
}
