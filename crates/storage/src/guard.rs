//! Migration guard: the only path that changes where a tenant's data lives.
//!
//! A mode change runs as a small state machine:
//!
//! ```text
//! REQUESTED -> VALIDATING -> PROBING -> CONFIRMING_DESTRUCTION -> APPLYING -> INITIALIZING -> COMPLETE
//! ```
//!
//! `PROBING` runs for self-hosted targets only and `INITIALIZING` only when
//! asked for. `CONFIRMING_DESTRUCTION` runs when the change moves any data
//! category to another store. Any state before `COMPLETE` may end in `FAILED`.
//! Nothing is written before `APPLYING`, so a failed probe or a refused
//! confirmation leaves the stored configuration untouched.
//!
//! At most one run per tenant is in flight; a second request is rejected with
//! [`StorageError::ConcurrentMigrationInProgress`] rather than queued. Across
//! processes the write in `APPLYING` is conditional on the row read in
//! `VALIDATING`, so a run whose assessment went stale fails the same way.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::{
    backend::ConnectionHandle,
    config_store::{ConfigStoreError, ConfigurationUpdate, StorageConfigStore, WriteCondition},
    error::StorageError,
    invalidation::CacheInvalidator,
    model::{
        ConnectionDetails, EntityCategory, StorageConfiguration, StorageMode, StorageTarget,
        StoreLocation, TenantId,
    },
    probe::{ConnectionProbeResult, ConnectionProber},
    router::StorageRouter,
    schema::{
        CollectionSpec, InitializationReport, InitializationStatus, SchemaInitializer,
        collections_for,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum MigrationState {
    Requested,
    Validating,
    Probing,
    ConfirmingDestruction,
    Applying,
    Initializing,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ModeChangeRequest {
    pub tenant_id: TenantId,
    pub target: StorageTarget,
    /// The caller accepts that data on the store being left becomes unreachable.
    pub confirm_destructive: bool,
    /// Initialize the self-hosted store once the change is applied.
    pub initialize_schema: bool,
}

/// What a refused change would have left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AtRiskData {
    pub from: StorageMode,
    pub to: StorageMode,
    /// Categories whose store changes.
    pub categories: Vec<EntityCategory>,
    /// Tenant rows per collection on the store being left; `None` when the
    /// count could not be obtained.
    pub counts: BTreeMap<String, Option<u64>>,
}

impl AtRiskData {
    /// Whether anything could be lost: rows were found, or a count is unknown.
    pub fn may_lose_data(&self) -> bool {
        self.counts
            .values()
            .any(|count| count.is_none_or(|count| count > 0))
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub configuration: StorageConfiguration,
    pub probe: Option<ConnectionProbeResult>,
    pub initialization: Option<InitializationReport>,
    pub transitions: Vec<MigrationState>,
    /// False when the tenant was already on the requested target.
    pub changed: bool,
}

/// Removes the tenant's in-flight marker when the run ends, however it ends.
struct InFlight {
    tenants: Arc<DashMap<TenantId, ()>>,
    tenant_id: TenantId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tenants.remove(&self.tenant_id);
    }
}

/// Transition log of one run.
struct Run {
    tenant_id: TenantId,
    transitions: Vec<MigrationState>,
}

impl Run {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            transitions: vec![MigrationState::Requested],
        }
    }

    fn enter(&mut self, state: MigrationState) {
        debug!(tenant_id = %self.tenant_id, ?state, "Storage migration transition");
        self.transitions.push(state);
    }

    fn fail(&mut self, error: StorageError) -> StorageError {
        warn!(tenant_id = %self.tenant_id, error = %error, "Storage migration failed");
        self.transitions.push(MigrationState::Failed);
        error
    }
}

#[derive(Clone)]
pub struct MigrationGuard {
    config_store: StorageConfigStore,
    router: Arc<StorageRouter>,
    invalidator: CacheInvalidator,
    prober: ConnectionProber,
    initializer: SchemaInitializer,
    count_timeout: Duration,
    in_flight: Arc<DashMap<TenantId, ()>>,
}

impl MigrationGuard {
    pub fn new(
        config_store: StorageConfigStore,
        router: Arc<StorageRouter>,
        invalidator: CacheInvalidator,
        prober: ConnectionProber,
        initializer: SchemaInitializer,
        count_timeout: Duration,
    ) -> Self {
        Self {
            config_store,
            router,
            invalidator,
            prober,
            initializer,
            count_timeout,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    fn begin(&self, tenant_id: &TenantId) -> Result<InFlight, StorageError> {
        match self.in_flight.entry(tenant_id.clone()) {
            Entry::Occupied(_) => {
                warn!(tenant_id = %tenant_id, "Rejected storage change: another one is in flight");
                Err(StorageError::ConcurrentMigrationInProgress(tenant_id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight {
                    tenants: Arc::clone(&self.in_flight),
                    tenant_id: tenant_id.clone(),
                })
            }
        }
    }

    pub fn is_in_flight(&self, tenant_id: &TenantId) -> bool {
        self.in_flight.contains_key(tenant_id)
    }

    /// Run one mode change to completion. Returns only after the new
    /// configuration is durable and every router cache in this process has
    /// forgotten the old one.
    pub async fn change_mode(
        &self,
        request: ModeChangeRequest,
    ) -> Result<MigrationOutcome, StorageError> {
        let _in_flight = self.begin(&request.tenant_id)?;
        let mut run = Run::new(request.tenant_id.clone());

        run.enter(MigrationState::Validating);
        let current = self
            .config_store
            .get(&request.tenant_id)
            .await
            .map_err(|e| run.fail(e.into()))?;

        if current.target == request.target {
            info!(
                tenant_id = %request.tenant_id,
                mode = %current.mode(),
                "Storage already on requested target"
            );
            let initialization = self.initialize_if_requested(&request, &mut run).await;
            run.enter(MigrationState::Complete);
            return Ok(MigrationOutcome {
                configuration: current,
                probe: None,
                initialization,
                transitions: run.transitions,
                changed: false,
            });
        }

        let mut probe = None;
        if let Some(connection) = request.target.connection() {
            run.enter(MigrationState::Probing);
            let result = self.prober.probe(connection).await;
            if !result.success {
                return Err(run.fail(StorageError::Connection(result)));
            }
            probe = Some(result);
        }

        let at_risk = self.assess(&current, &request.target).await;
        let always_destructive = current.mode() == StorageMode::SelfHosted
            && request.target.mode() == StorageMode::Official;
        if always_destructive || at_risk.may_lose_data() {
            run.enter(MigrationState::ConfirmingDestruction);
            if !request.confirm_destructive {
                return Err(run.fail(StorageError::DestructiveChangeRejected(at_risk)));
            }
            info!(
                tenant_id = %request.tenant_id,
                from = %at_risk.from,
                to = %at_risk.to,
                counts = ?at_risk.counts,
                "Destructive storage change confirmed"
            );
        }

        run.enter(MigrationState::Applying);
        let stored = match &request.target {
            StorageTarget::Official => {
                self.config_store
                    .reset_to_official(
                        &request.tenant_id,
                        WriteCondition::UpdatedAt(current.updated_at),
                    )
                    .await
            }
            target => {
                self.config_store
                    .set_if_unchanged(
                        &request.tenant_id,
                        ConfigurationUpdate {
                            target: target.clone(),
                            last_verified_at: probe.as_ref().map(|_| Utc::now()),
                        },
                        current.updated_at,
                    )
                    .await
            }
        };
        let configuration = stored.map_err(|e| {
            run.fail(match e {
                ConfigStoreError::Conflict { .. } => {
                    StorageError::ConcurrentMigrationInProgress(request.tenant_id.clone())
                }
                other => other.into(),
            })
        })?;
        self.invalidator.invalidate(&request.tenant_id);

        let initialization = self.initialize_if_requested(&request, &mut run).await;

        run.enter(MigrationState::Complete);
        info!(
            tenant_id = %request.tenant_id,
            from = %current.mode(),
            to = %configuration.mode(),
            "Storage mode changed"
        );
        Ok(MigrationOutcome {
            configuration,
            probe,
            initialization,
            transitions: run.transitions,
            changed: true,
        })
    }

    /// Initialize a store for the tenant outside a mode change.
    pub async fn initialize(
        &self,
        tenant_id: &TenantId,
        connection: &ConnectionDetails,
    ) -> Result<InitializationReport, StorageError> {
        let _in_flight = self.begin(tenant_id)?;
        let store = self.router.pools().get_or_open(connection)?;
        let report = self.initializer.initialize(&store).await;
        info!(
            tenant_id = %tenant_id,
            database = connection.database_name(),
            status = ?report.status,
            "Storage initialization finished"
        );
        Ok(report)
    }

    async fn initialize_if_requested(
        &self,
        request: &ModeChangeRequest,
        run: &mut Run,
    ) -> Option<InitializationReport> {
        if !request.initialize_schema {
            return None;
        }
        let connection = request.target.connection()?;
        run.enter(MigrationState::Initializing);

        let report = match self.router.pools().get_or_open(connection) {
            Ok(store) => self.initializer.initialize(&store).await,
            Err(e) => InitializationReport {
                status: InitializationStatus::Failed,
                errors: vec![e.to_string()],
                ..InitializationReport::default()
            },
        };
        if !report.is_complete() {
            // The configuration is committed; the caller gets the report as a warning.
            warn!(tenant_id = %request.tenant_id, summary = %report.summary(), "Storage initialization incomplete");
        }
        Some(report)
    }

    /// Tenant rows on every store a category would leave.
    async fn assess(&self, current: &StorageConfiguration, target: &StorageTarget) -> AtRiskData {
        let mut at_risk = AtRiskData {
            from: current.mode(),
            to: target.mode(),
            categories: Vec::new(),
            counts: BTreeMap::new(),
        };

        for category in EntityCategory::ALL {
            let leaving = current.target.location_for(category);
            if leaving == target.location_for(category) {
                continue;
            }
            at_risk.categories.push(category);

            let store = match self.handle_for(&current.target, &leaving) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(tenant_id = %current.tenant_id, location = %leaving, error = %e, "Cannot open store to count at-risk data");
                    None
                }
            };
            for collection in collections_for(category) {
                let count = match &store {
                    Some(store) => self.count(store, collection, &current.tenant_id).await,
                    None => None,
                };
                at_risk.counts.insert(collection.name.to_string(), count);
            }
        }
        at_risk
    }

    fn handle_for(
        &self,
        target: &StorageTarget,
        location: &StoreLocation,
    ) -> Result<ConnectionHandle, StorageError> {
        match (location, target.connection()) {
            (StoreLocation::SelfHosted { .. }, Some(connection)) => {
                Ok(self.router.pools().get_or_open(connection)?)
            }
            _ => Ok(self.router.official().clone()),
        }
    }

    async fn count(
        &self,
        store: &ConnectionHandle,
        collection: &CollectionSpec,
        tenant_id: &TenantId,
    ) -> Option<u64> {
        match tokio::time::timeout(self.count_timeout, store.count_for_tenant(collection, tenant_id))
            .await
        {
            Ok(Ok(count)) => Some(count),
            Ok(Err(e)) => {
                debug!(collection = collection.name, error = %e, "At-risk count unavailable");
                None
            }
            Err(_) => {
                debug!(collection = collection.name, "At-risk count timed out");
                None
            }
        }
    }
}
