//! Durable per-tenant storage configuration.
//!
//! Always kept in the official database: the router needs one fixed place to
//! learn where everything else lives. Connection strings are sealed with the
//! [`SecretCipher`] before they reach the repository.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::info;

use crate::{
    crypto::{CryptoError, SecretCipher},
    model::{
        ConnectionDetails, StorageConfiguration, StorageMode, StorageTarget, TenantId,
        ValidationError,
    },
};

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("stored configuration for tenant {tenant_id} is corrupt: {reason}")]
    Corrupt { tenant_id: String, reason: String },
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),
    #[error("configuration for tenant {tenant_id} changed since it was read")]
    Conflict { tenant_id: String },
}

/// Row layout of `storage_configurations`.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredConfiguration {
    pub tenant_id: String,
    pub mode: String,
    pub encrypted_connection_string: Option<String>,
    pub database_name: Option<String>,
    pub include_organization_metadata: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Precondition on the row a write replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    Unconditional,
    /// The row still carries this `updated_at`; `None` means no row exists yet.
    UpdatedAt(Option<DateTime<Utc>>),
}

impl WriteCondition {
    pub fn allows(&self, current: Option<DateTime<Utc>>) -> bool {
        match self {
            Self::Unconditional => true,
            Self::UpdatedAt(expected) => *expected == current,
        }
    }
}

#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<StoredConfiguration>, ConfigStoreError>;

    /// Replace the tenant's row atomically and return what was stored, or
    /// [`ConfigStoreError::Conflict`] when `condition` no longer holds.
    async fn upsert(
        &self,
        record: StoredConfiguration,
        condition: WriteCondition,
    ) -> Result<StoredConfiguration, ConfigStoreError>;
}

/// The next configuration for a tenant.
#[derive(Debug, Clone)]
pub struct ConfigurationUpdate {
    pub target: StorageTarget,
    pub last_verified_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct StorageConfigStore {
    repository: Arc<dyn ConfigRepository>,
    cipher: SecretCipher,
}

impl StorageConfigStore {
    pub fn new(repository: Arc<dyn ConfigRepository>, cipher: SecretCipher) -> Self {
        Self { repository, cipher }
    }

    /// The tenant's configuration, or the default OFFICIAL one if none was stored.
    pub async fn get(&self, tenant_id: &TenantId) -> Result<StorageConfiguration, ConfigStoreError> {
        match self.repository.fetch(tenant_id.as_str()).await? {
            Some(record) => self.decode(tenant_id, record),
            None => Ok(StorageConfiguration::official(tenant_id.clone())),
        }
    }

    pub async fn set(
        &self,
        tenant_id: &TenantId,
        update: ConfigurationUpdate,
    ) -> Result<StorageConfiguration, ConfigStoreError> {
        self.write(tenant_id, update, WriteCondition::Unconditional)
            .await
    }

    /// Like [`Self::set`], but only if the stored row is still the one that
    /// carried `expected` as its `updated_at` (`None`: no row yet).
    pub async fn set_if_unchanged(
        &self,
        tenant_id: &TenantId,
        update: ConfigurationUpdate,
        expected: Option<DateTime<Utc>>,
    ) -> Result<StorageConfiguration, ConfigStoreError> {
        self.write(tenant_id, update, WriteCondition::UpdatedAt(expected))
            .await
    }

    async fn write(
        &self,
        tenant_id: &TenantId,
        update: ConfigurationUpdate,
        condition: WriteCondition,
    ) -> Result<StorageConfiguration, ConfigStoreError> {
        let (encrypted_connection_string, database_name) = match update.target.connection() {
            Some(connection) => (
                Some(self.cipher.encrypt(connection.expose_connection_string())?),
                Some(connection.database_name().to_string()),
            ),
            None => (None, None),
        };

        let record = StoredConfiguration {
            tenant_id: tenant_id.to_string(),
            mode: update.target.mode().as_str().to_string(),
            encrypted_connection_string,
            database_name,
            include_organization_metadata: update.target.include_organization_metadata(),
            last_verified_at: update.last_verified_at,
            updated_at: Utc::now(),
        };

        let stored = self.repository.upsert(record, condition).await?;
        info!(
            tenant_id = %tenant_id,
            mode = %update.target.mode(),
            "Storage configuration stored"
        );
        self.decode(tenant_id, stored)
    }

    /// Back to the official store with the connection cleared. Rows are never deleted.
    pub async fn reset_to_official(
        &self,
        tenant_id: &TenantId,
        condition: WriteCondition,
    ) -> Result<StorageConfiguration, ConfigStoreError> {
        self.write(
            tenant_id,
            ConfigurationUpdate {
                target: StorageTarget::Official,
                last_verified_at: None,
            },
            condition,
        )
        .await
    }

    fn decode(
        &self,
        tenant_id: &TenantId,
        record: StoredConfiguration,
    ) -> Result<StorageConfiguration, ConfigStoreError> {
        let corrupt = |reason: String| ConfigStoreError::Corrupt {
            tenant_id: tenant_id.to_string(),
            reason,
        };
        let mode = StorageMode::from_db_value(&record.mode).map_err(|e| corrupt(e.to_string()))?;

        let target = match (
            mode,
            record.encrypted_connection_string,
            record.database_name,
        ) {
            (StorageMode::Official, None, None) => StorageTarget::Official,
            (StorageMode::SelfHosted, Some(sealed), Some(database_name)) => {
                let connection_string = self.cipher.decrypt(&sealed)?;
                let connection =
                    ConnectionDetails::new(connection_string.expose_secret(), database_name)
                        .map_err(|e: ValidationError| corrupt(e.to_string()))?;
                StorageTarget::SelfHosted {
                    connection,
                    include_organization_metadata: record.include_organization_metadata,
                }
            }
            (StorageMode::Official, _, _) => {
                return Err(corrupt("OFFICIAL mode with connection details".to_string()));
            }
            (StorageMode::SelfHosted, _, _) => {
                return Err(corrupt("SELF_HOSTED mode without connection details".to_string()));
            }
        };

        Ok(StorageConfiguration {
            tenant_id: tenant_id.clone(),
            target,
            last_verified_at: record.last_verified_at,
            updated_at: Some(record.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryConfigRepository, *};
    use crate::test_utils::test_cipher;

    fn store() -> (StorageConfigStore, MemoryConfigRepository) {
        let repository = MemoryConfigRepository::new();
        (
            StorageConfigStore::new(Arc::new(repository.clone()), test_cipher()),
            repository,
        )
    }

    fn tenant() -> TenantId {
        TenantId::new("org-42").unwrap()
    }

    fn self_hosted() -> StorageTarget {
        StorageTarget::SelfHosted {
            connection: ConnectionDetails::new("postgres://app:hunter2@db/app", "org42db")
                .unwrap(),
            include_organization_metadata: false,
        }
    }

    #[tokio::test]
    async fn test_get_defaults_to_official() {
        let (store, repository) = store();
        let config = store.get(&tenant()).await.unwrap();

        assert_eq!(config.mode(), StorageMode::Official);
        assert!(config.target.connection().is_none());
        assert!(repository.is_empty(), "reading must not create rows");
    }

    #[tokio::test]
    async fn test_set_round_trips_and_encrypts() {
        let (store, repository) = store();
        let verified = Utc::now();
        store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target: self_hosted(),
                    last_verified_at: Some(verified),
                },
            )
            .await
            .unwrap();

        let raw = repository.raw("org-42").unwrap();
        assert_eq!(raw.mode, "SELF_HOSTED");
        assert!(!raw.encrypted_connection_string.unwrap().contains("hunter2"));

        let config = store.get(&tenant()).await.unwrap();
        assert_eq!(config.target, self_hosted());
        assert_eq!(config.last_verified_at, Some(verified));
    }

    #[tokio::test]
    async fn test_reset_clears_connection_keeps_row() {
        let (store, repository) = store();
        store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target: self_hosted(),
                    last_verified_at: None,
                },
            )
            .await
            .unwrap();

        let config = store
            .reset_to_official(&tenant(), WriteCondition::Unconditional)
            .await
            .unwrap();

        assert_eq!(config.target, StorageTarget::Official);
        let raw = repository.raw("org-42").unwrap();
        assert_eq!(raw.mode, "OFFICIAL");
        assert!(raw.encrypted_connection_string.is_none());
        assert!(raw.database_name.is_none());
    }

    #[tokio::test]
    async fn test_conditional_write_detects_interleaved_change() {
        let (store, repository) = store();
        let seen = store.get(&tenant()).await.unwrap();
        assert!(seen.updated_at.is_none());

        // Someone else stores a configuration after we read.
        let theirs = store
            .set(
                &tenant(),
                ConfigurationUpdate {
                    target: self_hosted(),
                    last_verified_at: None,
                },
            )
            .await
            .unwrap();

        let err = store
            .reset_to_official(&tenant(), WriteCondition::UpdatedAt(seen.updated_at))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigStoreError::Conflict { .. }));
        assert_eq!(repository.raw("org-42").unwrap().mode, "SELF_HOSTED");

        let ours = store
            .reset_to_official(&tenant(), WriteCondition::UpdatedAt(theirs.updated_at))
            .await
            .unwrap();
        assert_eq!(ours.target, StorageTarget::Official);
    }

    #[tokio::test]
    async fn test_inconsistent_row_is_reported() {
        let (store, repository) = store();
        repository.put_raw(StoredConfiguration {
            tenant_id: "org-42".to_string(),
            mode: "SELF_HOSTED".to_string(),
            encrypted_connection_string: None,
            database_name: Some("org42db".to_string()),
            include_organization_metadata: false,
            last_verified_at: None,
            updated_at: Utc::now(),
        });

        let err = store.get(&tenant()).await.unwrap_err();
        assert!(matches!(err, ConfigStoreError::Corrupt { .. }));
    }
}
