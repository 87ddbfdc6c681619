//! Fan invalidations out to other server processes through Postgres
//! `LISTEN`/`NOTIFY` on the official database.
//!
//! Locally raised events are forwarded with `pg_notify`; notifications from
//! the channel are applied as remote events, which are never forwarded again.
//! A process also hears its own notifications, which is harmless since
//! invalidation is idempotent.

use std::time::Duration;

use sqlx::{PgPool, postgres::PgListener};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{CacheInvalidator, InvalidationOrigin};
use crate::model::TenantId;

pub const INVALIDATION_CHANNEL: &str = "storage_config_invalidated";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Spawn the forwarder and the listener. Both run until the runtime shuts down.
pub fn spawn_pg_invalidation_bridge(
    pool: PgPool,
    invalidator: CacheInvalidator,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let forwarder = tokio::spawn(forward_local_events(pool.clone(), invalidator.clone()));
    let listener = tokio::spawn(listen_for_remote_events(pool, invalidator));
    (forwarder, listener)
}

async fn forward_local_events(pool: PgPool, invalidator: CacheInvalidator) {
    let mut events = invalidator.subscribe();
    loop {
        match events.recv().await {
            Ok(event) if event.origin == InvalidationOrigin::Local => {
                let sent = sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(INVALIDATION_CHANNEL)
                    .bind(event.tenant_id.as_str())
                    .execute(&pool)
                    .await;
                if let Err(e) = sent {
                    warn!(
                        tenant_id = %event.tenant_id,
                        error = %e,
                        "Failed to publish storage invalidation; peers fall back to cache TTL"
                    );
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Invalidation forwarder lagged behind local events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn listen_for_remote_events(pool: PgPool, invalidator: CacheInvalidator) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "Invalidation listener could not connect, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(INVALIDATION_CHANNEL).await {
            warn!(error = %e, "Invalidation listener could not subscribe, retrying");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!(channel = INVALIDATION_CHANNEL, "Listening for storage invalidations");

        loop {
            match listener.recv().await {
                Ok(notification) => match TenantId::new(notification.payload()) {
                    Ok(tenant_id) => {
                        invalidator.apply_remote(&tenant_id);
                    }
                    Err(e) => debug!(error = %e, "Ignoring malformed invalidation payload"),
                },
                Err(e) => {
                    warn!(error = %e, "Invalidation listener lost its connection");
                    break;
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
