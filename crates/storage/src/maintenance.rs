//! Background sweeper for router caches and self-hosted pools.
//!
//! Expired cache entries and idle per-tenant refresh locks are dropped, then
//! every self-hosted pool that no live entry refers to leaves the registry.
//! Its connections close once the last handle still held by a request goes
//! away.

use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::service::{StorageService, SweepReport};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often to sweep (default: 60 seconds)
    pub sweep_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Spawn the sweeper as a background task.
pub fn spawn_maintenance_sweeper(
    service: StorageService,
    config: Option<MaintenanceConfig>,
) -> JoinHandle<()> {
    let config = config.unwrap_or_default();

    tokio::spawn(async move {
        let mut interval = time::interval(config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let report = service.sweep();
            if report != SweepReport::default() {
                info!(
                    entries_evicted = report.entries_evicted,
                    pools_released = report.pools_released,
                    locks_released = report.locks_released,
                    "Swept storage router"
                );
            } else {
                debug!("Nothing to sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(MaintenanceConfig::default().sweep_interval.as_secs(), 60);
    }
}
