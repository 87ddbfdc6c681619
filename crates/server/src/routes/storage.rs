//! Storage configuration endpoints.
//!
//! - `POST /storage/test-connection`: probe a candidate database, write nothing
//! - `POST /storage/configure`: switch a tenant between official and self-hosted storage
//! - `POST /storage/initialize`: create missing collections on a tenant store
//! - `POST /storage/invalidate-cache`: drop the tenant's cached routing decision
//! - `GET /storage/status`: current configuration and live per-category counts

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use storage::{
    ConnectionDetails, ConnectionProbeResult, InitializationReport, ModeChangeRequest,
    StorageConfigurationView, StorageMode, StorageStatus, StorageTarget, TenantId,
    model::ValidationError,
};
use tracing::instrument;
use ts_rs::TS;

use super::error::ErrorResponse;
use crate::AppState;

// =====================
// Request Types
// =====================

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct TestConnectionRequest {
    pub connection_string: String,
    pub database_name: String,
}

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConfigureRequest {
    pub tenant_id: String,
    pub mode: StorageMode,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub include_organization_metadata: Option<bool>,
    /// Accept that data on the store being left becomes unreachable.
    #[serde(default)]
    pub confirm_destructive: bool,
    /// Initialize the self-hosted store right after switching.
    #[serde(default)]
    pub initialize_schema: bool,
}

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InitializeRequest {
    pub tenant_id: String,
    pub connection_string: String,
    pub database_name: String,
}

#[derive(Debug, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct TenantRequest {
    pub tenant_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub tenant_id: String,
}

// =====================
// Response Types
// =====================

#[derive(Debug, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ConfigureResponse {
    pub success: bool,
    #[serde(flatten)]
    pub configuration: StorageConfigurationView,
    /// False when the tenant was already configured this way.
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialization: Option<InitializationReport>,
    /// Set when initialization needs manual follow-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct SuccessResponse {
    pub success: bool,
}

// =====================
// Router
// =====================

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/storage/test-connection", post(test_connection))
        .route("/storage/configure", post(configure))
        .route("/storage/initialize", post(initialize))
        .route("/storage/invalidate-cache", post(invalidate_cache))
        .route("/storage/status", get(status))
}

fn tenant_id(raw: &str) -> Result<TenantId, ErrorResponse> {
    TenantId::new(raw).map_err(|e| ErrorResponse::bad_request(e.to_string()))
}

fn connection(connection_string: &str, database_name: &str) -> Result<ConnectionDetails, ErrorResponse> {
    ConnectionDetails::new(connection_string, database_name)
        .map_err(|e| ErrorResponse::bad_request(e.to_string()))
}

fn target(request: &ConfigureRequest) -> Result<StorageTarget, ErrorResponse> {
    match request.mode {
        StorageMode::Official => {
            if request.connection_string.is_some() || request.database_name.is_some() {
                return Err(ErrorResponse::bad_request(
                    "connection details are only accepted for SELF_HOSTED mode",
                ));
            }
            Ok(StorageTarget::Official)
        }
        StorageMode::SelfHosted => {
            let (Some(connection_string), Some(database_name)) =
                (&request.connection_string, &request.database_name)
            else {
                return Err(ErrorResponse::bad_request(
                    ValidationError::MissingConnection.to_string(),
                ));
            };
            Ok(StorageTarget::SelfHosted {
                connection: connection(connection_string, database_name)?,
                include_organization_metadata: request
                    .include_organization_metadata
                    .unwrap_or(false),
            })
        }
    }
}

// =====================
// Handlers
// =====================

#[instrument(
    name = "storage.test_connection",
    skip(state, payload),
    fields(database = %payload.database_name)
)]
async fn test_connection(
    State(state): State<AppState>,
    Json(payload): Json<TestConnectionRequest>,
) -> Result<Json<ConnectionProbeResult>, ErrorResponse> {
    let connection = connection(&payload.connection_string, &payload.database_name)?;
    Ok(Json(state.storage().test_connection(&connection).await))
}

#[instrument(
    name = "storage.configure",
    skip(state, payload),
    fields(tenant_id = %payload.tenant_id, mode = %payload.mode)
)]
async fn configure(
    State(state): State<AppState>,
    Json(payload): Json<ConfigureRequest>,
) -> Result<Json<ConfigureResponse>, ErrorResponse> {
    let request = ModeChangeRequest {
        tenant_id: tenant_id(&payload.tenant_id)?,
        target: target(&payload)?,
        confirm_destructive: payload.confirm_destructive,
        initialize_schema: payload.initialize_schema,
    };

    let outcome = state.storage().configure(request).await?;
    let warning = outcome
        .initialization
        .as_ref()
        .filter(|report| !report.is_complete())
        .map(InitializationReport::summary);

    Ok(Json(ConfigureResponse {
        success: true,
        configuration: outcome.configuration.view(),
        changed: outcome.changed,
        initialization: outcome.initialization,
        warning,
    }))
}

#[instrument(
    name = "storage.initialize",
    skip(state, payload),
    fields(tenant_id = %payload.tenant_id, database = %payload.database_name)
)]
async fn initialize(
    State(state): State<AppState>,
    Json(payload): Json<InitializeRequest>,
) -> Result<Json<InitializationReport>, ErrorResponse> {
    let tenant_id = tenant_id(&payload.tenant_id)?;
    let connection = connection(&payload.connection_string, &payload.database_name)?;

    let report = state.storage().initialize(&tenant_id, &connection).await?;
    Ok(Json(report))
}

#[instrument(
    name = "storage.invalidate_cache",
    skip(state, payload),
    fields(tenant_id = %payload.tenant_id)
)]
async fn invalidate_cache(
    State(state): State<AppState>,
    Json(payload): Json<TenantRequest>,
) -> Result<Json<SuccessResponse>, ErrorResponse> {
    let tenant_id = tenant_id(&payload.tenant_id)?;
    state.storage().invalidate_cache(&tenant_id);
    Ok(Json(SuccessResponse { success: true }))
}

#[instrument(name = "storage.status", skip(state, query), fields(tenant_id = %query.tenant_id))]
async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StorageStatus>, ErrorResponse> {
    let tenant_id = tenant_id(&query.tenant_id)?;
    Ok(Json(state.storage().status(&tenant_id).await?))
}
