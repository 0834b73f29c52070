//! # systemsteuerung-store
//!
//! Multi-tenant, versioned JSON document storage for the Systemsteuerung
//! configuration backend.
//!
//! Every document table shares one canonical schema. A row is one version
//! of a document: the current version has `historisch = 0`, superseded
//! versions carry increasing generation numbers and a closed validity
//! window. Realms (identity, system, one per tenant) are routed to their
//! own SQLite databases, and a per-session cache keeps user settings and
//! tenant data close to the request path.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  SessionConfigCache (moka, singleflight) │
//! ├─────────────────────────────────────────┤
//! │  DocumentStore / DocumentTable           │
//! │    put · casPut · historize · asOf       │
//! │  KeyedLocks (per-uid write order)        │
//! ├─────────────────────────────────────────┤
//! │  ConnectionPool → RealmRouter            │
//! │  Database (rusqlite WAL) + migrations    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use systemsteuerung_store::{
//!     DocumentStore, PutOptions, Realm, SessionConfigCache, SessionKey, SteuerungConfig,
//! };
//!
//! let config = SteuerungConfig::load("systemsteuerung.toml")?;
//! let store = DocumentStore::from_config(&config)?;
//! let cache = SessionConfigCache::for_store(&store, &config);
//!
//! let settings = store.table(Realm::Identity, "benutzer_einstellungen")?;
//! settings.put("u-42", json!({"ui": {"theme": "dark"}}), PutOptions::default()).await?;
//!
//! let key = SessionKey::new("u-42", "acme");
//! assert_eq!(cache.get_setting(&key, "ui.theme").await?, json!("dark"));
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod locks;
pub mod migration;
pub mod pool;
pub mod realm;
pub mod schema;
pub mod store;

// ── re-exports ───────────────────────────────────────────────────────

pub use cache::{CacheStats, ConfigSource, SessionConfigCache, SessionConfigCacheBuilder, SessionKey};
pub use config::{CacheConfig, DatabaseConfig, RealmsConfig, SteuerungConfig, TablesConfig};
pub use db::{Database, DatabaseOptions};
pub use document::{DatenMatch, Document, DocumentFilter, PutOptions, content_hash};
pub use error::{StoreError, StoreResult};
pub use locks::{KeyLock, KeyedLocks};
pub use pool::ConnectionPool;
pub use realm::{ConnectionTarget, Realm, RealmKind, RealmRouter, RealmRouterBuilder};
pub use schema::{Column, ColumnType, Dialect, RealmLayout};
pub use store::{
    ChangeKind, ChangeListener, CurrentDocuments, DocumentChange, DocumentStore, DocumentTable,
};
