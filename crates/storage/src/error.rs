use thiserror::Error;

use crate::{
    backend::BackendError,
    config_store::ConfigStoreError,
    guard::AtRiskData,
    model::{TenantId, ValidationError},
    probe::ConnectionProbeResult,
    router::RouterError,
};

/// Failures of the storage operations exposed to callers.
///
/// A partially failed initialization is not an error: the configuration is
/// committed and the [`crate::schema::InitializationReport`] says what is left.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("connection check failed: {}", .0.message)]
    Connection(ConnectionProbeResult),
    #[error("switching storage would leave existing data unreachable; confirm to proceed")]
    DestructiveChangeRejected(AtRiskData),
    #[error("a storage change for tenant {0} is already in progress")]
    ConcurrentMigrationInProgress(TenantId),
    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Router(#[from] RouterError),
}
