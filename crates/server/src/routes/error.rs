use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use storage::{
    AtRiskData, FailureCategory, StorageError, config_store::ConfigStoreError,
    router::RouterError,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<FailureCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub destructive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_risk: Option<AtRiskData>,
}

#[derive(Debug)]
pub struct ErrorResponse {
    status: StatusCode,
    body: ErrorBody,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                success: false,
                message: message.into(),
                code,
                failure_category: None,
                error: None,
                destructive: false,
                at_risk: None,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", message)
    }

    fn internal(error: &dyn std::error::Error) -> Self {
        tracing::error!(error = %error, "storage operation failed");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "storage configuration is temporarily unavailable",
        )
    }
}

impl From<StorageError> for ErrorResponse {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Validation(e) => Self::bad_request(e.to_string()),
            StorageError::Connection(result) => {
                let mut response = Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "CONNECTION_FAILED",
                    result.message,
                );
                response.body.failure_category = result.failure_category;
                response.body.error = result.error;
                response
            }
            StorageError::DestructiveChangeRejected(at_risk) => {
                let mut response = Self::new(
                    StatusCode::CONFLICT,
                    "DESTRUCTIVE_CHANGE",
                    "This change leaves existing data unreachable. Repeat it with \
                     confirmDestructive set to proceed.",
                );
                response.body.destructive = true;
                response.body.at_risk = Some(at_risk);
                response
            }
            e @ StorageError::ConcurrentMigrationInProgress(_) => Self::new(
                StatusCode::CONFLICT,
                "MIGRATION_IN_PROGRESS",
                format!("{e}; retry once it has finished"),
            ),
            StorageError::Backend(e) | StorageError::Router(RouterError::Backend(e)) => {
                let category = e.category();
                let mut response = Self::new(
                    StatusCode::BAD_GATEWAY,
                    "STORE_UNAVAILABLE",
                    category.remediation("the configured database"),
                );
                response.body.failure_category = Some(category);
                response.body.error = Some(e.to_string());
                response
            }
            StorageError::ConfigStore(e) | StorageError::Router(RouterError::ConfigStore(e)) => {
                match e {
                    ConfigStoreError::Corrupt { .. } | ConfigStoreError::Crypto(_) => {
                        tracing::error!(error = %e, "stored storage configuration is corrupt");
                        Self::new(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "CORRUPT_CONFIGURATION",
                            "stored storage configuration is unreadable; check the encryption key",
                        )
                    }
                    other => Self::internal(&other),
                }
            }
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
