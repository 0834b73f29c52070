//! Startup configuration.
//!
//! [`SteuerungConfig`] is deserialized from TOML (or built in code) once at
//! process start and passed explicitly to the router, the connection pool,
//! and the session cache.
//!
//! ```toml
//! [realms]
//! identity = { file = "data/identity.db" }
//! system = { file = "data/system.db" }
//!
//! [realms.tenants]
//! acme = { file = "data/acme.db" }
//!
//! [tables]
//! settings = "benutzer_einstellungen"
//!
//! [cache]
//! ttl_seconds = 600
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::realm::ConnectionTarget;
use crate::schema;

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SteuerungConfig {
    pub realms: RealmsConfig,
    pub tables: TablesConfig,
    pub cache: CacheConfig,
    pub database: DatabaseConfig,
}

/// Realm → connection target mappings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmsConfig {
    pub identity: Option<ConnectionTarget>,
    pub system: Option<ConnectionTarget>,
    pub tenants: BTreeMap<String, ConnectionTarget>,
}

/// Names of the realm-specific tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    /// User identity table (identity realm, not a document table).
    pub identity: String,
    /// Per-user settings documents (identity realm).
    pub settings: String,
    /// Tenant application data documents (every tenant realm).
    pub tenant_data: String,
    /// Additional document tables provisioned in every tenant realm.
    pub tenant_extra: Vec<String>,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            identity: schema::IDENTITY_TABLE.to_string(),
            settings: schema::SETTINGS_TABLE.to_string(),
            tenant_data: schema::TENANT_DATA_TABLE.to_string(),
            tenant_extra: Vec::new(),
        }
    }
}

/// Session cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached documents (two per session).
    pub max_capacity: u64,
    /// Time-to-live of a cached document in seconds.
    pub ttl_seconds: u64,
    /// Evict entries not read for this many seconds (0 disables).
    pub idle_seconds: u64,
    /// `uid` of the application data document inside each tenant realm.
    pub tenant_document_uid: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl_seconds: 300,
            idle_seconds: 0,
            tenant_document_uid: "mandant".to_string(),
        }
    }
}

/// Connection handling per database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Read-only connections opened next to the writer for file targets.
    pub read_connections: usize,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Rows fetched per page when streaming `list_current`.
    pub list_page_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            read_connections: 4,
            busy_timeout_ms: 5_000,
            list_page_size: 256,
        }
    }
}

impl SteuerungConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StoreError::Config(format!("failed to parse TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            tenants = config.realms.tenants.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Check table names and sizing values.
    pub fn validate(&self) -> StoreResult<()> {
        let t = &self.tables;
        for name in [&t.identity, &t.settings, &t.tenant_data]
            .into_iter()
            .chain(t.tenant_extra.iter())
        {
            schema::validate_table_name(name)
                .map_err(|e| StoreError::Config(e.to_string()))?;
        }
        if t.identity == t.settings {
            return Err(StoreError::Config(
                "identity and settings tables must differ".into(),
            ));
        }
        if self.cache.tenant_document_uid.trim().is_empty() {
            return Err(StoreError::Config(
                "cache.tenant_document_uid must not be empty".into(),
            ));
        }
        if self.database.list_page_size == 0 {
            return Err(StoreError::Config(
                "database.list_page_size must be positive".into(),
            ));
        }
        let mut targets: HashMap<&ConnectionTarget, &str> = HashMap::new();
        for (id, target) in &self.realms.tenants {
            if id.trim().is_empty() || id == "identity" || id == "system" {
                return Err(StoreError::Config(format!("invalid tenant id: {id:?}")));
            }
            // Tenant realms share table names, so one database per tenant.
            if let Some(other) = targets.insert(target, id) {
                return Err(StoreError::Config(format!(
                    "tenants {other:?} and {id:?} are both routed to {target}"
                )));
            }
        }
        Ok(())
    }
}
