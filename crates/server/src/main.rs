use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use server::{AppState, config::ServerConfig, file_logging, routes};
use sqlx::{PgPool, postgres::PgPoolOptions};
use storage::{
    StorageService,
    backend::postgres::{DEFAULT_ACQUIRE_TIMEOUT, PgConnector, PgStore},
    config_store::postgres::PgConfigRepository,
    crypto::SecretCipher,
    invalidation::{CacheInvalidator, pg_notify::spawn_pg_invalidation_bridge},
    maintenance::spawn_maintenance_sweeper,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development)
    dotenvy::dotenv().ok();

    // The guard must be held for the lifetime of the application to ensure logs are flushed
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _file_log_guard = file_logging::init_logging(&log_level);

    let config = ServerConfig::from_env()?;
    let cipher = SecretCipher::from_base64_key(&config.encryption_key)
        .context("STORAGE_ENCRYPTION_KEY is not a base64 32-byte key")?;

    let pool = create_pool(&config)
        .await
        .context("failed to connect to the official database")?;
    storage::migrate(&pool)
        .await
        .context("failed to run official database migrations")?;

    let invalidator = CacheInvalidator::new();
    let service = StorageService::new(
        PgStore::official(pool.clone()).into_handle(),
        Arc::new(PgConfigRepository::new(pool.clone())),
        cipher,
        Arc::new(PgConnector::new(
            config.self_hosted_max_connections,
            DEFAULT_ACQUIRE_TIMEOUT,
        )),
        invalidator.clone(),
        config.service_settings(),
    );

    spawn_pg_invalidation_bridge(pool.clone(), invalidator);
    spawn_maintenance_sweeper(service.clone(), Some(config.maintenance()));

    let app_router = routes::router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "Storage server listening"
    );

    axum::serve(listener, app_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Closing database connection pool...");
    pool.close().await;
    Ok(())
}

async fn create_pool(config: &ServerConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url.expose_secret())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
