//! In-memory backend for tests.
//!
//! `memory://` connection strings resolve to named in-process databases held by
//! a [`MemoryConnector`]. Each database can be told to misbehave (unreachable,
//! rejecting the login, denying writes, failing index builds, being slow) so
//! probe and initialization paths can be exercised deterministically.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use super::{BackendConnector, BackendError, ConnectionHandle, StoreBackend};
use crate::{
    model::{ConnectionDetails, StoreLocation, TenantId},
    schema::{CollectionSpec, IndexSpec, TemplateColumn},
};

#[derive(Default)]
struct Collection {
    indexes: BTreeSet<String>,
    /// Owning tenant per row; `None` for template rows.
    rows: Vec<Option<String>>,
}

#[derive(Default)]
struct State {
    collections: BTreeMap<String, Collection>,
    unreachable: bool,
    reject_auth: bool,
    deny_write: bool,
    fail_indexes: bool,
    latency: Option<Duration>,
}

/// A named in-process database. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.lock().reject_auth = reject;
    }

    pub fn set_deny_write(&self, deny: bool) {
        self.lock().deny_write = deny;
    }

    pub fn fail_index_creation(&self, fail: bool) {
        self.lock().fail_indexes = fail;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn create_collection_raw(&self, name: &str) {
        self.lock().collections.entry(name.to_string()).or_default();
    }

    pub fn insert_rows(&self, collection: &str, tenant_id: Option<&str>, count: usize) {
        let mut state = self.lock();
        let collection = state.collections.entry(collection.to_string()).or_default();
        for _ in 0..count {
            collection.rows.push(tenant_id.map(str::to_string));
        }
    }

    pub fn row_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.rows.len())
            .unwrap_or(0)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    pub fn index_names(&self, collection: &str) -> Vec<String> {
        self.lock()
            .collections
            .get(collection)
            .map(|c| c.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Behave like a server round trip: wait, then fail the way a real server would.
    async fn gate(&self) -> Result<(), BackendError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let state = self.lock();
        if state.unreachable {
            return Err(BackendError::Network("connection refused".to_string()));
        }
        if state.reject_auth {
            return Err(BackendError::Auth(
                "password authentication failed for user".to_string(),
            ));
        }
        Ok(())
    }

    fn gate_write(&self) -> Result<(), BackendError> {
        if self.lock().deny_write {
            return Err(BackendError::Permission(
                "permission denied for schema public".to_string(),
            ));
        }
        Ok(())
    }
}

/// A [`MemoryDatabase`] seen from one location.
pub struct MemoryStore {
    database: MemoryDatabase,
    location: StoreLocation,
}

impl MemoryStore {
    pub fn official(database: MemoryDatabase) -> Self {
        Self {
            database,
            location: StoreLocation::Official,
        }
    }

    pub fn into_handle(self) -> ConnectionHandle {
        ConnectionHandle::new(Arc::new(self))
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.database.gate().await
    }

    async fn check_write_permission(&self) -> Result<(), BackendError> {
        self.database.gate().await?;
        self.database.gate_write()
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        self.database.gate().await?;
        Ok(self.database.collection_names())
    }

    async fn create_collection(&self, collection: &CollectionSpec) -> Result<(), BackendError> {
        self.database.gate().await?;
        self.database.gate_write()?;
        self.database.create_collection_raw(collection.name);
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, BackendError> {
        self.database.gate().await?;
        Ok(self.database.index_names(collection))
    }

    async fn create_index(
        &self,
        collection: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), BackendError> {
        self.database.gate().await?;
        self.database.gate_write()?;
        let mut state = self.database.lock();
        if state.fail_indexes {
            return Err(BackendError::Other(format!(
                "could not build index {}",
                index.name
            )));
        }
        let Some(target) = state.collections.get_mut(collection.name) else {
            return Err(BackendError::Other(format!(
                "relation \"{}\" does not exist",
                collection.name
            )));
        };
        target.indexes.insert(index.name.to_string());
        Ok(())
    }

    async fn count_all(&self, collection: &CollectionSpec) -> Result<u64, BackendError> {
        self.database.gate().await?;
        Ok(self.database.row_count(collection.name) as u64)
    }

    async fn count_for_tenant(
        &self,
        collection: &CollectionSpec,
        tenant_id: &TenantId,
    ) -> Result<u64, BackendError> {
        self.database.gate().await?;
        let state = self.database.lock();
        let count = state
            .collections
            .get(collection.name)
            .map(|c| {
                c.rows
                    .iter()
                    .filter(|owner| owner.as_deref() == Some(tenant_id.as_str()))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn seed_template_columns(
        &self,
        columns: &[TemplateColumn],
    ) -> Result<u64, BackendError> {
        self.database.gate().await?;
        self.database.gate_write()?;
        let mut state = self.database.lock();
        let target = state
            .collections
            .entry("board_columns".to_string())
            .or_default();
        if !target.rows.is_empty() {
            return Ok(0);
        }
        target.rows.extend(columns.iter().map(|_| None));
        Ok(columns.len() as u64)
    }

    async fn close(&self) {}
}

/// Resolves `memory://<anything>` URLs to databases named by `databaseName`.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    databases: Arc<DashMap<String, MemoryDatabase>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database called `name`, created empty on first use.
    pub fn database(&self, name: &str) -> MemoryDatabase {
        self.databases.entry(name.to_string()).or_default().clone()
    }
}

impl BackendConnector for MemoryConnector {
    fn open(&self, connection: &ConnectionDetails) -> Result<ConnectionHandle, BackendError> {
        let url = Url::parse(connection.expose_connection_string())
            .map_err(|e| BackendError::InvalidConnectionString(e.to_string()))?;
        if url.scheme() != "memory" {
            return Err(BackendError::UnsupportedScheme(url.scheme().to_string()));
        }

        let store = MemoryStore {
            database: self.database(connection.database_name()),
            location: StoreLocation::self_hosted(connection),
        };
        Ok(store.into_handle())
    }
}
