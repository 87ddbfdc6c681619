use async_trait::async_trait;
use sqlx::PgPool;

use super::{ConfigRepository, ConfigStoreError, StoredConfiguration, WriteCondition};

/// `storage_configurations` in the official database.
#[derive(Clone)]
pub struct PgConfigRepository {
    pool: PgPool,
}

impl PgConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepository for PgConfigRepository {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<StoredConfiguration>, ConfigStoreError> {
        let record = sqlx::query_as::<_, StoredConfiguration>(
            r#"
            SELECT
                tenant_id,
                mode,
                encrypted_connection_string,
                database_name,
                include_organization_metadata,
                last_verified_at,
                updated_at
            FROM storage_configurations
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert(
        &self,
        record: StoredConfiguration,
        condition: WriteCondition,
    ) -> Result<StoredConfiguration, ConfigStoreError> {
        let (unconditional, expected_updated_at) = match condition {
            WriteCondition::Unconditional => (true, None),
            WriteCondition::UpdatedAt(expected) => (false, expected),
        };
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query_as::<_, StoredConfiguration>(
            r#"
            INSERT INTO storage_configurations (
                tenant_id,
                mode,
                encrypted_connection_string,
                database_name,
                include_organization_metadata,
                last_verified_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id) DO UPDATE SET
                mode                          = EXCLUDED.mode,
                encrypted_connection_string   = EXCLUDED.encrypted_connection_string,
                database_name                 = EXCLUDED.database_name,
                include_organization_metadata = EXCLUDED.include_organization_metadata,
                last_verified_at              = EXCLUDED.last_verified_at,
                updated_at                    = EXCLUDED.updated_at
            WHERE $8::boolean
               OR storage_configurations.updated_at IS NOT DISTINCT FROM $9::timestamptz
            RETURNING
                tenant_id,
                mode,
                encrypted_connection_string,
                database_name,
                include_organization_metadata,
                last_verified_at,
                updated_at
            "#,
        )
        .bind(&record.tenant_id)
        .bind(&record.mode)
        .bind(&record.encrypted_connection_string)
        .bind(&record.database_name)
        .bind(record.include_organization_metadata)
        .bind(record.last_verified_at)
        .bind(record.updated_at)
        .bind(unconditional)
        .bind(expected_updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        // No row back: the conflicting row exists and the condition failed.
        let Some(stored) = stored else {
            tx.rollback().await?;
            return Err(ConfigStoreError::Conflict {
                tenant_id: record.tenant_id,
            });
        };
        tx.commit().await?;
        Ok(stored)
    }
}
