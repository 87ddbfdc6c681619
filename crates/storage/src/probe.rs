//! Connection probing.
//!
//! A probe opens the candidate database with a short timeout, runs a trivial
//! read and a permission check that writes nothing, then closes the pool. It
//! never retries; the caller decides what to do with the result.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ts_rs::TS;

use crate::{
    backend::{BackendConnector, BackendError},
    model::ConnectionDetails,
};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum FailureCategory {
    Network,
    Auth,
    Permission,
    Unknown,
}

impl FailureCategory {
    /// What the user can do about it.
    pub fn remediation(self, database_name: &str) -> String {
        match self {
            Self::Network => "Check the host, port and firewall rules, and that the database \
                              server is running and reachable from this service."
                .to_string(),
            Self::Auth => "Check the username and password in the connection string, and that \
                           the user may authenticate against this database."
                .to_string(),
            Self::Permission => format!(
                "Grant the user read/write access on database '{database_name}' \
                 (USAGE and CREATE on schema public)."
            ),
            Self::Unknown => {
                "Check the connection string format and the database name.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConnectionProbeResult {
    pub success: bool,
    pub message: String,
    pub failure_category: Option<FailureCategory>,
    /// Technical detail from the driver, when the probe failed.
    pub error: Option<String>,
}

impl ConnectionProbeResult {
    fn ok(database_name: &str) -> Self {
        Self {
            success: true,
            message: format!("Connected to '{database_name}' with read/write access"),
            failure_category: None,
            error: None,
        }
    }

    pub fn failed(error: &BackendError, database_name: &str) -> Self {
        let category = error.category();
        Self {
            success: false,
            message: category.remediation(database_name),
            failure_category: Some(category),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionProber {
    connector: Arc<dyn BackendConnector>,
    timeout: Duration,
}

impl ConnectionProber {
    pub fn new(connector: Arc<dyn BackendConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    pub async fn probe(&self, connection: &ConnectionDetails) -> ConnectionProbeResult {
        let database_name = connection.database_name();
        let outcome = tokio::time::timeout(self.timeout, self.try_probe(connection)).await;

        let result = match outcome {
            Ok(Ok(())) => ConnectionProbeResult::ok(database_name),
            Ok(Err(e)) => ConnectionProbeResult::failed(&e, database_name),
            Err(_) => ConnectionProbeResult::failed(
                &BackendError::Network(format!(
                    "no response within {}s",
                    self.timeout.as_secs()
                )),
                database_name,
            ),
        };

        if result.success {
            info!(
                connection = %connection.masked_connection_string(),
                database = database_name,
                "Connection probe succeeded"
            );
        } else {
            warn!(
                connection = %connection.masked_connection_string(),
                database = database_name,
                category = ?result.failure_category,
                error = result.error.as_deref().unwrap_or_default(),
                "Connection probe failed"
            );
        }
        result
    }

    async fn try_probe(&self, connection: &ConnectionDetails) -> Result<(), BackendError> {
        // A dedicated pool: the probe must not leave anything behind in the registry.
        let store = self.connector.open(connection)?;
        let outcome = async {
            store.ping().await?;
            store.check_write_permission().await
        }
        .await;
        store.close().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnector;

    fn prober(connector: &MemoryConnector) -> ConnectionProber {
        ConnectionProber::new(Arc::new(connector.clone()), Duration::from_secs(2))
    }

    fn details(db: &str) -> ConnectionDetails {
        ConnectionDetails::new("memory://app:pw@local", db).unwrap()
    }

    #[tokio::test]
    async fn test_probe_success_writes_nothing() {
        let connector = MemoryConnector::new();
        let result = prober(&connector).probe(&details("org42db")).await;

        assert!(result.success);
        assert!(result.failure_category.is_none());
        assert!(connector.database("org42db").collection_names().is_empty());
    }

    #[tokio::test]
    async fn test_probe_classifies_auth() {
        let connector = MemoryConnector::new();
        connector.database("locked").set_reject_auth(true);

        let result = prober(&connector).probe(&details("locked")).await;

        assert!(!result.success);
        assert_eq!(result.failure_category, Some(FailureCategory::Auth));
    }

    #[tokio::test]
    async fn test_probe_classifies_permission_with_hint() {
        let connector = MemoryConnector::new();
        connector.database("readonly").set_deny_write(true);

        let result = prober(&connector).probe(&details("readonly")).await;

        assert_eq!(result.failure_category, Some(FailureCategory::Permission));
        assert!(result.message.contains("'readonly'"));
    }

    #[tokio::test]
    async fn test_probe_classifies_network() {
        let connector = MemoryConnector::new();
        connector.database("gone").set_unreachable(true);

        let result = prober(&connector).probe(&details("gone")).await;

        assert_eq!(result.failure_category, Some(FailureCategory::Network));
    }

    #[tokio::test]
    async fn test_probe_unknown_for_foreign_scheme() {
        let connector = MemoryConnector::new();
        let details = ConnectionDetails::new("mongodb://u:p@host", "db").unwrap();

        let result = prober(&connector).probe(&details).await;

        assert_eq!(result.failure_category, Some(FailureCategory::Unknown));
        assert!(result.error.unwrap().contains("mongodb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out_as_network() {
        let connector = MemoryConnector::new();
        connector
            .database("slow")
            .set_latency(Duration::from_secs(60));

        let result = prober(&connector).probe(&details("slow")).await;

        assert!(!result.success);
        assert_eq!(result.failure_category, Some(FailureCategory::Network));
        assert!(result.error.unwrap().contains("no response"));
    }
}
