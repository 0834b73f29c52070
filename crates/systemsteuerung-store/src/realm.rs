//! Realm router.
//!
//! Every document table lives in exactly one *realm*: the identity realm
//! (user identities and their settings), the shared system realm (menus,
//! layouts, dropdown data, ...), or one tenant realm per mandant. The
//! [`RealmRouter`] resolves a realm to the physical [`ConnectionTarget`]
//! that holds its database.
//!
//! The router is built once from [`RealmsConfig`](crate::config::RealmsConfig)
//! and is immutable afterwards. It is cheaply cloneable and shared by the
//! connection pool.
//!
//! # Example
//!
//! ```rust
//! # use systemsteuerung_store::realm::{ConnectionTarget, Realm, RealmRouter};
//! let router = RealmRouter::builder()
//!     .identity(ConnectionTarget::memory("identity"))
//!     .system(ConnectionTarget::memory("system"))
//!     .tenant("acme", ConnectionTarget::memory("acme"))
//!     .build();
//!
//! let target = router.resolve(&Realm::tenant("acme")).unwrap();
//! assert_eq!(target, &ConnectionTarget::memory("acme"));
//! assert!(router.resolve_name("globex").is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RealmsConfig;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A logical database scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Realm {
    /// User identities and per-user settings.
    Identity,
    /// Mandant-independent catalog tables shared by all tenants.
    System,
    /// The application data of a single tenant.
    Tenant(String),
}

impl Realm {
    /// Shorthand for `Realm::Tenant(id.into())`.
    pub fn tenant(id: impl Into<String>) -> Self {
        Self::Tenant(id.into())
    }

    /// The layout this realm follows.
    pub fn kind(&self) -> RealmKind {
        match self {
            Self::Identity => RealmKind::Identity,
            Self::System => RealmKind::System,
            Self::Tenant(_) => RealmKind::Tenant,
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => f.write_str("identity"),
            Self::System => f.write_str("system"),
            Self::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

impl FromStr for Realm {
    type Err = StoreError;

    /// Parse a logical realm name: `identity`, `system`, `tenant:<id>`, or a
    /// bare tenant id.
    fn from_str(s: &str) -> StoreResult<Self> {
        let s = s.trim();
        match s {
            "" => Err(StoreError::UnknownRealm(String::new())),
            "identity" => Ok(Self::Identity),
            "system" => Ok(Self::System),
            other => {
                let id = other.strip_prefix("tenant:").unwrap_or(other);
                if id.is_empty() {
                    return Err(StoreError::UnknownRealm(other.to_string()));
                }
                Ok(Self::Tenant(id.to_string()))
            }
        }
    }
}

/// The three realm layouts. Tenant realms all share one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealmKind {
    Identity,
    System,
    Tenant,
}

impl RealmKind {
    /// Stable name used for migration bookkeeping.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::System => "system",
            Self::Tenant => "tenant",
        }
    }
}

/// Physical location of a realm's database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionTarget {
    /// A SQLite database file.
    File(PathBuf),
    /// A named in-memory database living as long as the pool that opened it.
    Memory(String),
}

impl ConnectionTarget {
    /// Shorthand for `ConnectionTarget::File(path.into())`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Shorthand for `ConnectionTarget::Memory(name.into())`.
    pub fn memory(name: impl Into<String>) -> Self {
        Self::Memory(name.into())
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Memory(name) => write!(f, "memory:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Immutable realm → connection target mapping.
#[derive(Debug, Clone)]
pub struct RealmRouter {
    routes: Arc<HashMap<Realm, ConnectionTarget>>,
}

impl RealmRouter {
    /// Start building a router.
    pub fn builder() -> RealmRouterBuilder {
        RealmRouterBuilder::default()
    }

    /// Build the router from the `[realms]` configuration section.
    pub fn from_config(config: &RealmsConfig) -> Self {
        let mut builder = Self::builder();
        if let Some(target) = &config.identity {
            builder = builder.identity(target.clone());
        }
        if let Some(target) = &config.system {
            builder = builder.system(target.clone());
        }
        for (id, target) in &config.tenants {
            builder = builder.tenant(id.clone(), target.clone());
        }
        builder.build()
    }

    /// Resolve a realm to its connection target.
    pub fn resolve(&self, realm: &Realm) -> StoreResult<&ConnectionTarget> {
        let target = self
            .routes
            .get(realm)
            .ok_or_else(|| StoreError::UnknownRealm(realm.to_string()))?;
        debug!(%realm, %target, "realm resolved");
        Ok(target)
    }

    /// Parse a logical name and resolve it.
    pub fn resolve_name(&self, logical_name: &str) -> StoreResult<&ConnectionTarget> {
        let realm: Realm = logical_name.parse()?;
        self.resolve(&realm)
    }

    /// Whether the realm has a registered mapping.
    pub fn contains(&self, realm: &Realm) -> bool {
        self.routes.contains_key(realm)
    }

    /// All registered tenant ids, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routes
            .keys()
            .filter_map(|realm| match realm {
                Realm::Tenant(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered realms.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no realm is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builder for [`RealmRouter`]. Later registrations for the same realm
/// replace earlier ones.
#[derive(Debug, Default)]
pub struct RealmRouterBuilder {
    routes: HashMap<Realm, ConnectionTarget>,
}

impl RealmRouterBuilder {
    /// Map the identity realm.
    pub fn identity(self, target: ConnectionTarget) -> Self {
        self.route(Realm::Identity, target)
    }

    /// Map the shared system realm.
    pub fn system(self, target: ConnectionTarget) -> Self {
        self.route(Realm::System, target)
    }

    /// Map a tenant realm.
    pub fn tenant(self, id: impl Into<String>, target: ConnectionTarget) -> Self {
        self.route(Realm::Tenant(id.into()), target)
    }

    /// Map an arbitrary realm.
    pub fn route(mut self, realm: Realm, target: ConnectionTarget) -> Self {
        debug!(%realm, %target, "realm route added");
        self.routes.insert(realm, target);
        self
    }

    /// Freeze the mapping.
    pub fn build(self) -> RealmRouter {
        info!(realms = self.routes.len(), "realm router built");
        RealmRouter {
            routes: Arc::new(self.routes),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
