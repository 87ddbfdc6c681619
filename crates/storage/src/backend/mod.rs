//! Physical stores.
//!
//! A [`StoreBackend`] is one concrete database: the official Postgres instance
//! or a tenant-supplied one. Backends are opened lazily through a
//! [`BackendConnector`] so resolving a tenant never blocks on the network;
//! the first query pays the connection cost.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

use std::{fmt, ops::Deref, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::{
    model::{ConnectionDetails, StoreLocation, TenantId},
    probe::FailureCategory,
    schema::{CollectionSpec, IndexSpec, TemplateColumn},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("unsupported connection scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Network(_) => FailureCategory::Network,
            Self::Auth(_) => FailureCategory::Auth,
            Self::Permission(_) => FailureCategory::Permission,
            Self::InvalidConnectionString(_) | Self::UnsupportedScheme(_) | Self::Other(_) => {
                FailureCategory::Unknown
            }
        }
    }
}

/// Operations the routing core needs from a physical database.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn location(&self) -> &StoreLocation;

    /// Trivial read proving the database is reachable and the login works.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Check, without writing anything, that the login may create and write tables.
    async fn check_write_permission(&self) -> Result<(), BackendError>;

    async fn list_collections(&self) -> Result<Vec<String>, BackendError>;

    async fn create_collection(&self, collection: &CollectionSpec) -> Result<(), BackendError>;

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, BackendError>;

    async fn create_index(
        &self,
        collection: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), BackendError>;

    async fn count_all(&self, collection: &CollectionSpec) -> Result<u64, BackendError>;

    async fn count_for_tenant(
        &self,
        collection: &CollectionSpec,
        tenant_id: &TenantId,
    ) -> Result<u64, BackendError>;

    /// Insert the template board columns if, and only if, `board_columns` is empty.
    /// Returns the number of rows inserted.
    async fn seed_template_columns(&self, columns: &[TemplateColumn])
    -> Result<u64, BackendError>;

    async fn close(&self);
}

/// Opens backends for tenant-supplied connection details.
pub trait BackendConnector: Send + Sync {
    /// Build a handle without touching the network.
    fn open(&self, connection: &ConnectionDetails) -> Result<ConnectionHandle, BackendError>;
}

/// Shared reference to a physical database, as handed out by the router.
#[derive(Clone)]
pub struct ConnectionHandle {
    backend: Arc<dyn StoreBackend>,
}

impl ConnectionHandle {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    pub fn is_official(&self) -> bool {
        self.backend.location().is_official()
    }

    pub fn same_store(&self, other: &ConnectionHandle) -> bool {
        self.backend.location() == other.backend.location()
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn StoreBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionHandle")
            .field(self.backend.location())
            .finish()
    }
}

/// Self-hosted handles keyed by connection fingerprint, so every tenant
/// pointing at the same database shares one pool.
#[derive(Clone)]
pub struct PoolRegistry {
    connector: Arc<dyn BackendConnector>,
    pools: Arc<DashMap<String, ConnectionHandle>>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            pools: Arc::new(DashMap::new()),
        }
    }

    pub fn get_or_open(
        &self,
        connection: &ConnectionDetails,
    ) -> Result<ConnectionHandle, BackendError> {
        let fingerprint = connection.fingerprint();
        if let Some(handle) = self.pools.get(&fingerprint) {
            return Ok(handle.clone());
        }

        let handle = self.connector.open(connection)?;
        // Another task may have opened the same pool meanwhile; keep the first one.
        let handle = self.pools.entry(fingerprint).or_insert(handle).clone();
        Ok(handle)
    }

    /// Drop pools whose fingerprint is not in `live`. Handles still held by
    /// in-flight requests stay usable until they are dropped.
    pub fn retain_live(&self, live: &[String]) -> usize {
        let before = self.pools.len();
        self.pools.retain(|fingerprint, _| live.contains(fingerprint));
        before - self.pools.len()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryConnector, *};

    fn details(db: &str) -> ConnectionDetails {
        ConnectionDetails::new("memory://app:pw@local", db).unwrap()
    }

    #[test]
    fn test_registry_reuses_pool_per_fingerprint() {
        let registry = PoolRegistry::new(Arc::new(MemoryConnector::new()));
        let a = registry.get_or_open(&details("a")).unwrap();
        let again = registry.get_or_open(&details("a")).unwrap();
        let b = registry.get_or_open(&details("b")).unwrap();

        assert!(a.same_store(&again));
        assert!(!a.same_store(&b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_retain_live() {
        let registry = PoolRegistry::new(Arc::new(MemoryConnector::new()));
        registry.get_or_open(&details("a")).unwrap();
        registry.get_or_open(&details("b")).unwrap();

        let removed = registry.retain_live(&[details("a").fingerprint()]);
        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            BackendError::Network("timeout".into()).category(),
            FailureCategory::Network
        );
        assert_eq!(
            BackendError::Auth("bad password".into()).category(),
            FailureCategory::Auth
        );
        assert_eq!(
            BackendError::Permission("no".into()).category(),
            FailureCategory::Permission
        );
        assert_eq!(
            BackendError::UnsupportedScheme("mongodb".into()).category(),
            FailureCategory::Unknown
        );
    }
}
