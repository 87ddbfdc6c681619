//! Storage configuration model.
//!
//! A tenant (a user's personal workspace or an organization) is either served
//! by the official database or by a database it supplies itself. The choice is
//! a tagged union so a connection can only exist alongside `SELF_HOSTED`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use ts_rs::TS;
use url::Url;

/// Postgres truncates identifiers beyond this length.
const MAX_DATABASE_NAME_LEN: usize = 63;
const MAX_TENANT_ID_LEN: usize = 128;
const MASK: &str = "****";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tenant id must not be empty")]
    EmptyTenantId,
    #[error("tenant id must be at most {MAX_TENANT_ID_LEN} characters without whitespace")]
    InvalidTenantId,
    #[error("connection string must not be empty")]
    EmptyConnectionString,
    #[error("database name must not be empty")]
    EmptyDatabaseName,
    #[error(
        "database name '{0}' is invalid: use at most {MAX_DATABASE_NAME_LEN} letters, digits, '_' or '-'"
    )]
    InvalidDatabaseName(String),
    #[error("connection details are required for SELF_HOSTED mode")]
    MissingConnection,
    #[error("unknown storage mode '{0}'")]
    UnknownMode(String),
}

/// Identifier of a user or organization owning a storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ValidationError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyTenantId);
        }
        if trimmed.len() > MAX_TENANT_ID_LEN || trimmed.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidTenantId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum StorageMode {
    Official,
    SelfHosted,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Official => "OFFICIAL",
            Self::SelfHosted => "SELF_HOSTED",
        }
    }

    pub fn from_db_value(value: &str) -> Result<Self, ValidationError> {
        match value {
            "OFFICIAL" => Ok(Self::Official),
            "SELF_HOSTED" => Ok(Self::SelfHosted),
            other => Err(ValidationError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of data deciding which store governs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum EntityCategory {
    /// Users and organization membership. Always official.
    MembershipAndIdentity,
    /// Tasks, board columns, comments and time entries.
    TaskData,
    /// Boards and organization settings.
    OrganizationMetadata,
}

impl EntityCategory {
    pub const ALL: [EntityCategory; 3] = [
        Self::MembershipAndIdentity,
        Self::TaskData,
        Self::OrganizationMetadata,
    ];
}

/// Credentials and target database of a tenant-supplied store.
#[derive(Clone)]
pub struct ConnectionDetails {
    connection_string: SecretString,
    database_name: String,
}

impl ConnectionDetails {
    pub fn new(
        connection_string: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(ValidationError::EmptyConnectionString);
        }

        let database_name = database_name.into().trim().to_string();
        if database_name.is_empty() {
            return Err(ValidationError::EmptyDatabaseName);
        }
        let valid_chars = database_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_chars || database_name.len() > MAX_DATABASE_NAME_LEN {
            return Err(ValidationError::InvalidDatabaseName(database_name));
        }

        Ok(Self {
            connection_string: SecretString::from(connection_string.trim().to_string()),
            database_name,
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Plaintext connection string. Only backends and the at-rest cipher read it.
    pub(crate) fn expose_connection_string(&self) -> &str {
        self.connection_string.expose_secret()
    }

    pub fn masked_connection_string(&self) -> String {
        mask_connection_string(self.connection_string.expose_secret())
    }

    /// Stable identity of the physical database, safe to log and use as a key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.connection_string.expose_secret().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.database_name.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn masked(&self) -> MaskedConnection {
        MaskedConnection {
            connection_string: self.masked_connection_string(),
            database_name: self.database_name.clone(),
        }
    }
}

impl PartialEq for ConnectionDetails {
    fn eq(&self, other: &Self) -> bool {
        self.database_name == other.database_name
            && self.connection_string.expose_secret() == other.connection_string.expose_secret()
    }
}

impl Eq for ConnectionDetails {}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("connection_string", &self.masked_connection_string())
            .field("database_name", &self.database_name)
            .finish()
    }
}

/// Where a tenant's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Official,
    SelfHosted {
        connection: ConnectionDetails,
        /// Boards and organization settings follow the self-hosted store too.
        /// Membership and identity never do.
        include_organization_metadata: bool,
    },
}

impl StorageTarget {
    pub fn mode(&self) -> StorageMode {
        match self {
            Self::Official => StorageMode::Official,
            Self::SelfHosted { .. } => StorageMode::SelfHosted,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionDetails> {
        match self {
            Self::Official => None,
            Self::SelfHosted { connection, .. } => Some(connection),
        }
    }

    pub fn include_organization_metadata(&self) -> bool {
        match self {
            Self::Official => false,
            Self::SelfHosted {
                include_organization_metadata,
                ..
            } => *include_organization_metadata,
        }
    }

    /// Whether data of `category` is served by the self-hosted store.
    pub fn routes_to_self_hosted(&self, category: EntityCategory) -> bool {
        match (self, category) {
            (_, EntityCategory::MembershipAndIdentity) => false,
            (Self::Official, _) => false,
            (Self::SelfHosted { .. }, EntityCategory::TaskData) => true,
            (
                Self::SelfHosted {
                    include_organization_metadata,
                    ..
                },
                EntityCategory::OrganizationMetadata,
            ) => *include_organization_metadata,
        }
    }

    /// Physical location serving `category` under this target.
    pub fn location_for(&self, category: EntityCategory) -> StoreLocation {
        match self.connection() {
            Some(connection) if self.routes_to_self_hosted(category) => {
                StoreLocation::self_hosted(connection)
            }
            _ => StoreLocation::Official,
        }
    }
}

/// Identity of a physical database, comparable without exposing credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    Official,
    SelfHosted {
        database_name: String,
        fingerprint: String,
    },
}

impl StoreLocation {
    pub fn self_hosted(connection: &ConnectionDetails) -> Self {
        Self::SelfHosted {
            database_name: connection.database_name().to_string(),
            fingerprint: connection.fingerprint(),
        }
    }

    pub fn is_official(&self) -> bool {
        matches!(self, Self::Official)
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Official => f.write_str("official"),
            Self::SelfHosted { database_name, .. } => write!(f, "self-hosted:{database_name}"),
        }
    }
}

/// Durable storage configuration of one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfiguration {
    pub tenant_id: TenantId,
    pub target: StorageTarget,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StorageConfiguration {
    /// Configuration of a tenant that never chose anything.
    pub fn official(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            target: StorageTarget::Official,
            last_verified_at: None,
            updated_at: None,
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.target.mode()
    }

    pub fn view(&self) -> StorageConfigurationView {
        StorageConfigurationView {
            tenant_id: self.tenant_id.to_string(),
            mode: self.mode(),
            connection: self.target.connection().map(ConnectionDetails::masked),
            include_organization_metadata: self.target.include_organization_metadata(),
            last_verified_at: self.last_verified_at,
            updated_at: self.updated_at,
        }
    }
}

/// Connection details with the password hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MaskedConnection {
    pub connection_string: String,
    pub database_name: String,
}

/// Storage configuration as shown to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StorageConfigurationView {
    pub tenant_id: String,
    pub mode: StorageMode,
    pub connection: Option<MaskedConnection>,
    pub include_organization_metadata: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Hide the password of a URL-style connection string.
///
/// Anything that does not parse as a URL with a host is masked entirely.
pub fn mask_connection_string(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return MASK.to_string();
    };
    if url.cannot_be_a_base() || !url.has_host() {
        return MASK.to_string();
    }
    if url.password().is_some() && url.set_password(Some(MASK)).is_err() {
        return MASK.to_string();
    }
    url.set_query(None);
    url.to_string()
}
