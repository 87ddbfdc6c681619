//! Per-tenant storage routing.
//!
//! Every tenant's task data lives either in the official database or in a
//! database the tenant supplies. This crate decides which one serves a given
//! request, keeps that decision coherent across caches, and guards the
//! transitions between the two.

pub mod backend;
pub mod cache;
pub mod config_store;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod invalidation;
pub mod maintenance;
pub mod model;
pub mod probe;
pub mod router;
pub mod schema;
pub mod service;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use sqlx::{PgPool, migrate::MigrateError};

pub use backend::{BackendConnector, BackendError, ConnectionHandle, StoreBackend};
pub use error::StorageError;
pub use guard::{AtRiskData, MigrationOutcome, MigrationState, ModeChangeRequest};
pub use model::{
    ConnectionDetails, EntityCategory, StorageConfiguration, StorageConfigurationView,
    StorageMode, StorageTarget, TenantId,
};
pub use probe::{ConnectionProbeResult, FailureCategory};
pub use schema::{InitializationReport, InitializationStatus};
pub use service::{ServiceSettings, StorageService, StorageStatus};

/// Apply the official database migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
