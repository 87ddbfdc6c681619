use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use url::Url;
use uuid::Uuid;

use super::{BackendConnector, BackendError, ConnectionHandle, StoreBackend};
use crate::{
    model::{ConnectionDetails, StoreLocation, TenantId},
    schema::{BOARD_COLUMNS, CollectionSpec, IndexSpec, TemplateColumn},
};

/// Default number of connections per self-hosted pool.
pub const DEFAULT_SELF_HOSTED_MAX_CONNECTIONS: u32 = 5;

/// How long a query waits for a pooled connection before reporting a network failure.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// A Postgres database, official or tenant-supplied.
pub struct PgStore {
    pool: PgPool,
    location: StoreLocation,
}

impl PgStore {
    pub fn official(pool: PgPool) -> Self {
        Self {
            pool,
            location: StoreLocation::Official,
        }
    }

    pub fn into_handle(self) -> ConnectionHandle {
        ConnectionHandle::new(std::sync::Arc::new(self))
    }
}

/// Map driver errors onto the categories callers can act on.
pub fn classify(err: sqlx::Error) -> BackendError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => BackendError::Network(err.to_string()),
        sqlx::Error::Configuration(_) => BackendError::InvalidConnectionString(err.to_string()),
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                // invalid_password, invalid_authorization_specification
                Some("28P01") | Some("28000") => BackendError::Auth(message),
                // insufficient_privilege
                Some("42501") => BackendError::Permission(message),
                // connection_exception class
                Some(code) if code.starts_with("08") => BackendError::Network(message),
                // invalid_catalog_name
                Some("3D000") => BackendError::Other(format!("database does not exist: {message}")),
                _ => BackendError::Other(message),
            }
        }
        _ => BackendError::Other(err.to_string()),
    }
}

#[async_trait]
impl StoreBackend for PgStore {
    fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn ping(&self) -> Result<(), BackendError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn check_write_permission(&self) -> Result<(), BackendError> {
        let (database, can_use, can_create): (String, bool, bool) = sqlx::query_as(
            r#"
            SELECT
                current_database()::text,
                has_schema_privilege(current_user, 'public', 'USAGE'),
                has_schema_privilege(current_user, 'public', 'CREATE')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        if can_use && can_create {
            Ok(())
        } else {
            Err(BackendError::Permission(format!(
                "current role cannot create tables in schema public of database '{database}'"
            )))
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = 'public'
              AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    async fn create_collection(&self, collection: &CollectionSpec) -> Result<(), BackendError> {
        sqlx::query(collection.ddl)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, BackendError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT indexname::text
            FROM pg_indexes
            WHERE schemaname = 'public'
              AND tablename = $1
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)
    }

    async fn create_index(
        &self,
        collection: &CollectionSpec,
        index: &IndexSpec,
    ) -> Result<(), BackendError> {
        let statement = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            index.name, collection.name, index.columns
        );
        sqlx::query(&statement)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn count_all(&self, collection: &CollectionSpec) -> Result<u64, BackendError> {
        let statement = format!("SELECT COUNT(*) FROM {}", collection.name);
        let count: i64 = sqlx::query_scalar(&statement)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn count_for_tenant(
        &self,
        collection: &CollectionSpec,
        tenant_id: &TenantId,
    ) -> Result<u64, BackendError> {
        let statement = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text = $1",
            collection.name, collection.tenant_column
        );
        let count: i64 = sqlx::query_scalar(&statement)
            .bind(tenant_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(count.max(0) as u64)
    }

    async fn seed_template_columns(
        &self,
        columns: &[TemplateColumn],
    ) -> Result<u64, BackendError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        // Serialize concurrent seeders so the emptiness check stays true until commit.
        sqlx::query("LOCK TABLE board_columns IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        let existing: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            BOARD_COLUMNS.name
        ))
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;
        if existing > 0 {
            tx.rollback().await.map_err(classify)?;
            return Ok(0);
        }

        for column in columns {
            sqlx::query(
                r#"
                INSERT INTO board_columns (id, tenant_id, name, position, is_template)
                VALUES ($1, NULL, $2, $3, TRUE)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(column.name)
            .bind(column.position)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(columns.len() as u64)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens lazily-connecting pools for tenant-supplied Postgres databases.
#[derive(Debug, Clone)]
pub struct PgConnector {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self::new(DEFAULT_SELF_HOSTED_MAX_CONNECTIONS, DEFAULT_ACQUIRE_TIMEOUT)
    }
}

impl PgConnector {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout,
        }
    }

    fn connect_options(connection: &ConnectionDetails) -> Result<PgConnectOptions, BackendError> {
        let raw = connection.expose_connection_string();
        let url = Url::parse(raw).map_err(|e| BackendError::InvalidConnectionString(e.to_string()))?;
        match url.scheme() {
            "postgres" | "postgresql" => {}
            other => return Err(BackendError::UnsupportedScheme(other.to_string())),
        }

        let options = PgConnectOptions::from_str(raw).map_err(classify)?;
        Ok(options.database(connection.database_name()))
    }
}

impl BackendConnector for PgConnector {
    fn open(&self, connection: &ConnectionDetails) -> Result<ConnectionHandle, BackendError> {
        let options = Self::connect_options(connection)?;
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy_with(options);

        let store = PgStore {
            pool,
            location: StoreLocation::self_hosted(connection),
        };
        Ok(store.into_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(raw: &str) -> ConnectionDetails {
        ConnectionDetails::new(raw, "org42db").unwrap()
    }

    #[test]
    fn test_rejects_foreign_schemes() {
        let result = PgConnector::connect_options(&details("mongodb://u:p@host:27017"));
        assert_eq!(
            result.unwrap_err(),
            BackendError::UnsupportedScheme("mongodb".to_string())
        );
    }

    #[test]
    fn test_rejects_unparseable_strings() {
        let result = PgConnector::connect_options(&details("definitely not a url"));
        assert!(matches!(
            result,
            Err(BackendError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_database_name_overrides_url() {
        let options =
            PgConnector::connect_options(&details("postgresql://u:p@db.internal:5432/postgres"))
                .unwrap();
        assert_eq!(options.get_database(), Some("org42db"));
        assert_eq!(options.get_host(), "db.internal");
    }

    #[test]
    fn test_classify_transport_errors_as_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify(sqlx::Error::Io(io)),
            BackendError::Network(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut),
            BackendError::Network(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            BackendError::Other(_)
        ));
    }
}
