//! Session configuration cache using [`moka`].
//!
//! Each session (user + active tenant) sees two documents: the user's
//! settings from the identity realm and the tenant's application data from
//! the tenant realm. Both are loaded at most once per session and kept in a
//! `moka::future::Cache`; concurrent first reads of the same session share a
//! single load.
//!
//! Paths address fields inside a cached document: `ui.theme`, `recent.0`
//! (numeric segments index arrays), or a JSON Pointer such as `/ui/theme`.
//!
//! Every session carries a generation number that is part of the cache key.
//! Invalidating a session moves it to a fresh generation, so a read after
//! the invalidation never joins a load that started before it, and that
//! load's result is discarded once it lands.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::SteuerungConfig;
use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::realm::Realm;
use crate::schema;
use crate::store::{ChangeListener, DocumentChange, DocumentStore};

// ── source ───────────────────────────────────────────────────────────

/// Where the cache loads documents from. Implemented by
/// [`DocumentStore`].
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// The current document `uid` of `table` in `realm`.
    async fn load(&self, realm: &Realm, table: &str, uid: &str) -> StoreResult<Document>;
}

#[async_trait]
impl ConfigSource for DocumentStore {
    async fn load(&self, realm: &Realm, table: &str, uid: &str) -> StoreResult<Document> {
        self.table(realm.clone(), table)?.get_current(uid).await
    }
}

// ── session key ──────────────────────────────────────────────────────

/// Scope of cached configuration: one user working in one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user: String,
    pub tenant: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            tenant: tenant.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.tenant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Settings,
    TenantData,
}

const SCOPES: [Scope; 2] = [Scope::Settings, Scope::TenantData];

/// Session, scope and the session generation the entry was loaded under.
type EntryKey = (SessionKey, Scope, u64);

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads served without starting a load.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that started a load.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Loads issued against the source (including failed ones).
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.loads.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} loads={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.loads(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── session cache ────────────────────────────────────────────────────

/// Per-session cache of user settings and tenant application data.
///
/// Cheap to clone; clones share entries and statistics.
///
/// # Example
///
/// ```ignore
/// let store = DocumentStore::from_config(&config)?;
/// let cache = SessionConfigCache::for_store(&store, &config);
///
/// let key = SessionKey::new("u-42", "acme");
/// let theme = cache.get_setting(&key, "ui.theme").await?;
/// let currency = cache.get_tenant_data(&key, "/waehrung").await?;
/// cache.end_session(&key).await;
/// ```
#[derive(Clone)]
pub struct SessionConfigCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    source: Arc<dyn ConfigSource>,
    entries: Cache<EntryKey, Arc<Value>>,
    /// Live sessions and their current generation. Pruned when moka evicts
    /// an entry of the current generation.
    sessions: Arc<DashMap<SessionKey, u64>>,
    generations: AtomicU64,
    settings_table: String,
    tenant_table: String,
    tenant_uid: String,
    stats: CacheStats,
}

impl SessionConfigCache {
    /// Start building a cache over `source`.
    pub fn builder(source: Arc<dyn ConfigSource>) -> SessionConfigCacheBuilder {
        SessionConfigCacheBuilder {
            source,
            max_capacity: 10_000,
            ttl_seconds: 300,
            idle_seconds: 0,
            settings_table: schema::SETTINGS_TABLE.to_string(),
            tenant_table: schema::TENANT_DATA_TABLE.to_string(),
            tenant_uid: "mandant".to_string(),
        }
    }

    /// A builder preloaded with the `[cache]` and `[tables]` sections.
    pub fn builder_from_config(
        source: Arc<dyn ConfigSource>,
        config: &SteuerungConfig,
    ) -> SessionConfigCacheBuilder {
        Self::builder(source)
            .max_capacity(config.cache.max_capacity)
            .ttl_seconds(config.cache.ttl_seconds)
            .idle_seconds(config.cache.idle_seconds)
            .settings_table(config.tables.settings.clone())
            .tenant_table(config.tables.tenant_data.clone())
            .tenant_document_uid(config.cache.tenant_document_uid.clone())
    }

    /// Build a cache over `store` and subscribe it to the store's changes,
    /// so writes to a cached document drop the affected sessions' entries.
    pub fn for_store(store: &DocumentStore, config: &SteuerungConfig) -> Self {
        let cache = Self::builder_from_config(Arc::new(store.clone()), config).build();
        cache.listen_to(store);
        cache
    }

    /// Subscribe to committed changes of `store`.
    pub fn listen_to(&self, store: &DocumentStore) {
        let weak = Arc::downgrade(&self.inner);
        store.add_listener(weak);
    }

    /// A value from the user's settings document.
    #[instrument(skip(self), fields(session = %key))]
    pub async fn get_setting(&self, key: &SessionKey, path: &str) -> StoreResult<Value> {
        let doc = self.document(key, Scope::Settings).await?;
        lookup(&doc, path)
    }

    /// A value from the tenant's application data document.
    #[instrument(skip(self), fields(session = %key))]
    pub async fn get_tenant_data(&self, key: &SessionKey, path: &str) -> StoreResult<Value> {
        let doc = self.document(key, Scope::TenantData).await?;
        lookup(&doc, path)
    }

    /// [`get_setting`](Self::get_setting) deserialized into `T`.
    pub async fn setting_as<T: DeserializeOwned>(
        &self,
        key: &SessionKey,
        path: &str,
    ) -> StoreResult<T> {
        Ok(serde_json::from_value(self.get_setting(key, path).await?)?)
    }

    /// Drop the cached documents of `key`. The next read loads again.
    pub async fn invalidate(&self, key: &SessionKey) {
        self.inner.invalidate(key).await;
    }

    /// Release everything cached for `key`. Idempotent.
    pub async fn end_session(&self, key: &SessionKey) {
        if let Some((_, generation)) = self.inner.sessions.remove(key) {
            self.inner.evict(key, generation).await;
            debug!(session = %key, "session ended");
        }
    }

    /// Number of sessions with cached documents (or a load in flight).
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Approximate number of cached documents.
    pub fn entry_count(&self) -> u64 {
        self.inner.entries.entry_count()
    }

    /// Apply pending evictions so [`entry_count`](Self::entry_count) and
    /// [`session_count`](Self::session_count) are exact.
    pub async fn sync(&self) {
        self.inner.entries.run_pending_tasks().await;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    async fn document(&self, key: &SessionKey, scope: Scope) -> StoreResult<Arc<Value>> {
        let inner = &self.inner;
        let generation = *inner
            .sessions
            .entry(key.clone())
            .or_insert_with(|| inner.next_generation());
        let entry_key = (key.clone(), scope, generation);

        let (realm, table, uid) = match scope {
            Scope::Settings => (Realm::Identity, inner.settings_table.as_str(), key.user.as_str()),
            Scope::TenantData => (
                Realm::Tenant(key.tenant.clone()),
                inner.tenant_table.as_str(),
                inner.tenant_uid.as_str(),
            ),
        };

        let entry = inner
            .entries
            .entry(entry_key.clone())
            .or_try_insert_with(async {
                inner.stats.record_load();
                debug!(session = %key, ?scope, "loading configuration document");
                match inner.source.load(&realm, table, uid).await {
                    Ok(doc) => Ok(Arc::new(doc.daten)),
                    // An absent document caches as null; every path misses.
                    Err(err) if err.is_not_found() => Ok(Arc::new(Value::Null)),
                    Err(err) => Err(err),
                }
            })
            .await
            .map_err(StoreError::from_shared)?;

        if inner.sessions.get(key).map(|g| *g) != Some(generation) {
            // Invalidated or ended while loading.
            inner.entries.invalidate(&entry_key).await;
        }

        if entry.is_fresh() {
            inner.stats.record_miss();
        } else {
            inner.stats.record_hit();
            debug!(session = %key, ?scope, "cache hit");
        }
        Ok(entry.into_value())
    }
}

impl CacheInner {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    async fn invalidate(&self, key: &SessionKey) {
        let next = self.next_generation();
        let Some(previous) = self
            .sessions
            .get_mut(key)
            .map(|mut g| std::mem::replace(g.value_mut(), next))
        else {
            return;
        };
        self.evict(key, previous).await;
        debug!(session = %key, "session invalidated");
    }

    async fn evict(&self, key: &SessionKey, generation: u64) {
        for scope in SCOPES {
            self.entries
                .invalidate(&(key.clone(), scope, generation))
                .await;
        }
    }
}

#[async_trait]
impl ChangeListener for CacheInner {
    async fn document_changed(&self, change: &DocumentChange) {
        let affected: Vec<SessionKey> = match &change.realm {
            Realm::Identity if change.table == self.settings_table => self
                .sessions
                .iter()
                .filter(|s| s.key().user == change.uid)
                .map(|s| s.key().clone())
                .collect(),
            Realm::Tenant(tenant)
                if change.table == self.tenant_table && change.uid == self.tenant_uid =>
            {
                self.sessions
                    .iter()
                    .filter(|s| &s.key().tenant == tenant)
                    .map(|s| s.key().clone())
                    .collect()
            }
            _ => return,
        };
        for key in affected {
            self.invalidate(&key).await;
        }
    }
}

/// Resolve `path` inside a cached document.
fn lookup(doc: &Value, path: &str) -> StoreResult<Value> {
    let missing = || StoreError::KeyNotFound {
        path: path.to_string(),
    };
    if doc.is_null() {
        return Err(missing());
    }
    if path.is_empty() {
        return Ok(doc.clone());
    }
    if path.starts_with('/') {
        return doc.pointer(path).cloned().ok_or_else(missing);
    }

    let mut node = doc;
    for segment in path.split('.') {
        node = match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(missing)?;
    }
    Ok(node.clone())
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`SessionConfigCache`].
pub struct SessionConfigCacheBuilder {
    source: Arc<dyn ConfigSource>,
    max_capacity: u64,
    ttl_seconds: u64,
    idle_seconds: u64,
    settings_table: String,
    tenant_table: String,
    tenant_uid: String,
}

impl SessionConfigCacheBuilder {
    /// Maximum number of cached documents.
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// Time-to-live in seconds for each document.
    pub fn ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = secs;
        self
    }

    /// Evict documents not read for this many seconds; 0 disables.
    pub fn idle_seconds(mut self, secs: u64) -> Self {
        self.idle_seconds = secs;
        self
    }

    pub fn settings_table(mut self, table: impl Into<String>) -> Self {
        self.settings_table = table.into();
        self
    }

    pub fn tenant_table(mut self, table: impl Into<String>) -> Self {
        self.tenant_table = table.into();
        self
    }

    pub fn tenant_document_uid(mut self, uid: impl Into<String>) -> Self {
        self.tenant_uid = uid.into();
        self
    }

    /// Build the cache.
    pub fn build(self) -> SessionConfigCache {
        let sessions: Arc<DashMap<SessionKey, u64>> = Arc::default();
        let index = Arc::clone(&sessions);
        let mut builder = Cache::builder()
            .max_capacity(self.max_capacity)
            .time_to_live(Duration::from_secs(self.ttl_seconds))
            .eviction_listener(
                move |key: Arc<EntryKey>, _value: Arc<Value>, cause: RemovalCause| {
                    // Explicit removals keep the index in sync themselves.
                    if cause.was_evicted() {
                        let (session, _, generation) = key.as_ref();
                        index.remove_if(session, |_, current| current == generation);
                    }
                },
            );
        if self.idle_seconds > 0 {
            builder = builder.time_to_idle(Duration::from_secs(self.idle_seconds));
        }

        debug!(
            max_capacity = self.max_capacity,
            ttl_seconds = self.ttl_seconds,
            idle_seconds = self.idle_seconds,
            "session cache created"
        );

        SessionConfigCache {
            inner: Arc::new(CacheInner {
                source: self.source,
                entries: builder.build(),
                sessions,
                generations: AtomicU64::new(0),
                settings_table: self.settings_table,
                tenant_table: self.tenant_table,
                tenant_uid: self.tenant_uid,
                stats: CacheStats::new(),
            }),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
