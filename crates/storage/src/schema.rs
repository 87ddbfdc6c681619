//! Collections and indexes a tenant store needs, and the initializer that
//! creates the missing ones.
//!
//! Initialization only ever adds: it inspects what exists, creates what is
//! missing, seeds template board columns into an empty `board_columns`, and
//! never drops, truncates or rewrites anything.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ts_rs::TS;

use crate::{backend::ConnectionHandle, model::EntityCategory};

/// Default upper bound for one initialization run.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static str,
}

/// A table owned by the routing core. Names are static so they can be spliced
/// into SQL safely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub category: EntityCategory,
    /// Column holding the owning tenant, used for per-tenant counts.
    pub tenant_column: &'static str,
    pub ddl: &'static str,
    pub indexes: &'static [IndexSpec],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateColumn {
    pub name: &'static str,
    pub position: i32,
}

pub const BOARD_COLUMNS: CollectionSpec = CollectionSpec {
    name: "board_columns",
    category: EntityCategory::TaskData,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS board_columns (
            id          UUID PRIMARY KEY,
            tenant_id   TEXT,
            board_id    UUID,
            name        TEXT NOT NULL,
            position    INTEGER NOT NULL,
            is_template BOOLEAN NOT NULL DEFAULT FALSE,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
    "#,
    indexes: &[IndexSpec {
        name: "idx_board_columns_tenant_position",
        columns: "tenant_id, position",
    }],
};

pub const TASKS: CollectionSpec = CollectionSpec {
    name: "tasks",
    category: EntityCategory::TaskData,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id          UUID PRIMARY KEY,
            tenant_id   TEXT NOT NULL,
            board_id    UUID,
            column_id   UUID,
            title       TEXT NOT NULL,
            description TEXT,
            position    INTEGER NOT NULL DEFAULT 0,
            assignee_id TEXT,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
    "#,
    indexes: &[
        IndexSpec {
            name: "idx_tasks_tenant_column",
            columns: "tenant_id, column_id",
        },
        IndexSpec {
            name: "idx_tasks_tenant_updated",
            columns: "tenant_id, updated_at DESC",
        },
    ],
};

pub const TASK_COMMENTS: CollectionSpec = CollectionSpec {
    name: "task_comments",
    category: EntityCategory::TaskData,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS task_comments (
            id         UUID PRIMARY KEY,
            tenant_id  TEXT NOT NULL,
            task_id    UUID NOT NULL,
            author_id  TEXT NOT NULL,
            body       TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
    "#,
    indexes: &[IndexSpec {
        name: "idx_task_comments_task",
        columns: "task_id, created_at",
    }],
};

pub const TIME_ENTRIES: CollectionSpec = CollectionSpec {
    name: "time_entries",
    category: EntityCategory::TaskData,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS time_entries (
            id               UUID PRIMARY KEY,
            tenant_id        TEXT NOT NULL,
            task_id          UUID NOT NULL,
            user_id          TEXT NOT NULL,
            started_at       TIMESTAMPTZ NOT NULL,
            ended_at         TIMESTAMPTZ,
            duration_seconds BIGINT
        )
    "#,
    indexes: &[
        IndexSpec {
            name: "idx_time_entries_task",
            columns: "task_id",
        },
        IndexSpec {
            name: "idx_time_entries_user",
            columns: "tenant_id, user_id, started_at",
        },
    ],
};

pub const BOARDS: CollectionSpec = CollectionSpec {
    name: "boards",
    category: EntityCategory::OrganizationMetadata,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS boards (
            id          UUID PRIMARY KEY,
            tenant_id   TEXT NOT NULL,
            name        TEXT NOT NULL,
            description TEXT,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
    "#,
    indexes: &[IndexSpec {
        name: "idx_boards_tenant",
        columns: "tenant_id",
    }],
};

pub const ORGANIZATION_SETTINGS: CollectionSpec = CollectionSpec {
    name: "organization_settings",
    category: EntityCategory::OrganizationMetadata,
    tenant_column: "tenant_id",
    ddl: r#"
        CREATE TABLE IF NOT EXISTS organization_settings (
            tenant_id  TEXT PRIMARY KEY,
            settings   JSONB NOT NULL DEFAULT '{}'::jsonb,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
    "#,
    indexes: &[],
};

/// Created by the official database migrations only; never on a self-hosted store.
pub const ORGANIZATION_MEMBERS: CollectionSpec = CollectionSpec {
    name: "organization_members",
    category: EntityCategory::MembershipAndIdentity,
    tenant_column: "organization_id",
    ddl: "",
    indexes: &[],
};

/// Collections the initializer manages on every tenant store, in creation order.
pub const MANAGED_COLLECTIONS: &[CollectionSpec] = &[
    BOARD_COLUMNS,
    TASKS,
    TASK_COMMENTS,
    TIME_ENTRIES,
    BOARDS,
    ORGANIZATION_SETTINGS,
];

pub const TEMPLATE_COLUMNS: &[TemplateColumn] = &[
    TemplateColumn {
        name: "To Do",
        position: 0,
    },
    TemplateColumn {
        name: "In Progress",
        position: 1,
    },
    TemplateColumn {
        name: "In Review",
        position: 2,
    },
    TemplateColumn {
        name: "Done",
        position: 3,
    },
];

/// Collections governed by `category`, wherever they live.
pub fn collections_for(category: EntityCategory) -> Vec<&'static CollectionSpec> {
    match category {
        EntityCategory::MembershipAndIdentity => vec![&ORGANIZATION_MEMBERS],
        _ => MANAGED_COLLECTIONS
            .iter()
            .filter(|collection| collection.category == category)
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum InitializationStatus {
    Complete,
    /// Some collections, indexes or seed rows could not be created. Whatever
    /// was created stays; the store needs manual follow-up.
    PartialFailure,
    /// The store could not even be inspected; nothing was changed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InitializationReport {
    pub status: InitializationStatus,
    pub collections_created: u32,
    pub indexes_created: u32,
    pub default_data_created: bool,
    pub preserved_existing_data: bool,
    /// Row counts of collections that already existed before this run.
    pub existing_data: BTreeMap<String, u64>,
    pub errors: Vec<String>,
}

impl Default for InitializationReport {
    fn default() -> Self {
        Self {
            status: InitializationStatus::Complete,
            collections_created: 0,
            indexes_created: 0,
            default_data_created: false,
            preserved_existing_data: false,
            existing_data: BTreeMap::new(),
            errors: Vec::new(),
        }
    }
}

impl InitializationReport {
    pub fn is_complete(&self) -> bool {
        self.status == InitializationStatus::Complete
    }

    pub fn summary(&self) -> String {
        match self.status {
            InitializationStatus::Complete => format!(
                "Database ready: {} collections and {} indexes created",
                self.collections_created, self.indexes_created
            ),
            InitializationStatus::PartialFailure => format!(
                "Storage configured but may need manual follow-up: {}",
                self.errors.join("; ")
            ),
            InitializationStatus::Failed => {
                format!("Database could not be initialized: {}", self.errors.join("; "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaInitializer {
    timeout: Duration,
}

impl Default for SchemaInitializer {
    fn default() -> Self {
        Self::new(DEFAULT_INIT_TIMEOUT)
    }
}

impl SchemaInitializer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn initialize(&self, store: &ConnectionHandle) -> InitializationReport {
        let mut report = InitializationReport::default();

        let outcome = tokio::time::timeout(self.timeout, run(store, &mut report)).await;
        if outcome.is_err() {
            report.errors.push(format!(
                "initialization timed out after {}s",
                self.timeout.as_secs()
            ));
        }

        report.status = if report.errors.is_empty() {
            InitializationStatus::Complete
        } else if report.collections_created > 0
            || report.indexes_created > 0
            || report.preserved_existing_data
        {
            InitializationStatus::PartialFailure
        } else {
            InitializationStatus::Failed
        };

        match report.status {
            InitializationStatus::Complete => info!(
                location = %store.location(),
                collections_created = report.collections_created,
                indexes_created = report.indexes_created,
                default_data_created = report.default_data_created,
                preserved_existing_data = report.preserved_existing_data,
                "Tenant store initialized"
            ),
            _ => warn!(
                location = %store.location(),
                status = ?report.status,
                errors = ?report.errors,
                "Tenant store initialization incomplete"
            ),
        }

        report
    }
}

async fn run(store: &ConnectionHandle, report: &mut InitializationReport) {
    let existing = match store.list_collections().await {
        Ok(existing) => existing,
        Err(e) => {
            report.errors.push(format!("listing collections failed: {e}"));
            return;
        }
    };

    let mut usable = Vec::with_capacity(MANAGED_COLLECTIONS.len());
    for collection in MANAGED_COLLECTIONS {
        if existing.iter().any(|name| name == collection.name) {
            report.preserved_existing_data = true;
            match store.count_all(collection).await {
                Ok(count) => {
                    report
                        .existing_data
                        .insert(collection.name.to_string(), count);
                }
                Err(e) => report
                    .errors
                    .push(format!("counting {} failed: {e}", collection.name)),
            }
            usable.push(collection);
            continue;
        }

        match store.create_collection(collection).await {
            Ok(()) => {
                report.collections_created += 1;
                usable.push(collection);
            }
            Err(e) => report
                .errors
                .push(format!("creating collection {} failed: {e}", collection.name)),
        }
    }

    for collection in &usable {
        if collection.indexes.is_empty() {
            continue;
        }
        let indexes = match store.list_indexes(collection.name).await {
            Ok(indexes) => indexes,
            Err(e) => {
                report
                    .errors
                    .push(format!("listing indexes of {} failed: {e}", collection.name));
                continue;
            }
        };
        for index in collection.indexes {
            if indexes.iter().any(|name| name == index.name) {
                continue;
            }
            match store.create_index(collection, index).await {
                Ok(()) => report.indexes_created += 1,
                Err(e) => report
                    .errors
                    .push(format!("creating index {} failed: {e}", index.name)),
            }
        }
    }

    if usable.iter().any(|collection| collection.name == BOARD_COLUMNS.name) {
        match store.seed_template_columns(TEMPLATE_COLUMNS).await {
            Ok(inserted) => report.default_data_created = inserted > 0,
            Err(e) => report
                .errors
                .push(format!("seeding default board columns failed: {e}")),
        }
    }
}
