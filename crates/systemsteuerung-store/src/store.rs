//! Versioned document store.
//!
//! Every write follows the same pattern inside one IMMEDIATE transaction:
//! the current row of the `uid` (if any) is retired into the next history
//! generation with `gilt_bis = now`, then a new current row is inserted
//! carrying the previous payload in `daten_backup`. A per-document async
//! lock serializes writers of the same `uid`; the lock guard travels into
//! the blocking database task and is released only after commit or
//! rollback.
//!
//! ```ignore
//! let store = DocumentStore::from_config(&config)?;
//! let menus = store.table(Realm::System, "menuedaten")?;
//!
//! let v1 = menus.put("haupt", json!({"items": []}), PutOptions::default()).await?;
//! let v2 = menus.cas_put("haupt", &v1.source_hash, json!({"items": ["a"]}), PutOptions::default()).await?;
//! assert_eq!(menus.as_of("haupt", v1.created_at).await?.daten, v1.daten);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::SteuerungConfig;
use crate::document::{
    self, Document, DocumentFilter, PutOptions, content_hash, encode_timestamp, far_future,
};
use crate::error::{StoreError, StoreResult};
use crate::locks::KeyedLocks;
use crate::pool::ConnectionPool;
use crate::realm::Realm;
use crate::schema::{self, COLUMN_LIST, FAR_FUTURE};

// ═══════════════════════════════════════════════════════════════════════
//  Change notification
// ═══════════════════════════════════════════════════════════════════════

/// What a committed write did to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// First current row for the uid.
    Created,
    /// Current row replaced; the previous one was historized.
    Updated,
    /// Current row retired without a replacement.
    Historized,
}

/// A committed change, delivered to every [`ChangeListener`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub realm: Realm,
    pub table: String,
    pub uid: String,
    pub kind: ChangeKind,
    /// Hash of the new current payload, `None` after a historization.
    pub source_hash: Option<String>,
}

/// Receives committed changes, after the transaction is durable.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn document_changed(&self, change: &DocumentChange);
}

// ═══════════════════════════════════════════════════════════════════════
//  DocumentStore
// ═══════════════════════════════════════════════════════════════════════

/// Entry point of the store: owns the pool, the write locks, and the
/// change listeners. Cheap to clone.
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    pool: ConnectionPool,
    locks: KeyedLocks,
    listeners: RwLock<Vec<Weak<dyn ChangeListener>>>,
    page_size: u32,
}

impl DocumentStore {
    /// Default number of rows fetched per `list_current` page.
    pub const DEFAULT_PAGE_SIZE: u32 = 256;

    /// Create a store over an existing pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self::with_page_size(pool, Self::DEFAULT_PAGE_SIZE)
    }

    /// Create a store with a custom `list_current` page size.
    pub fn with_page_size(pool: ConnectionPool, page_size: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                pool,
                locks: KeyedLocks::new(),
                listeners: RwLock::new(Vec::new()),
                page_size: page_size.max(1),
            }),
        }
    }

    /// Build router, pool, and store from a configuration.
    pub fn from_config(config: &SteuerungConfig) -> StoreResult<Self> {
        let pool = ConnectionPool::from_config(config)?;
        Ok(Self::with_page_size(pool, config.database.list_page_size))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// A handle to one document table. Fails with
    /// [`StoreError::UnknownRealm`] if the realm is not routed and with
    /// [`StoreError::Validation`] if the table is not a document table of
    /// the realm's layout.
    pub fn table(&self, realm: Realm, table: &str) -> StoreResult<DocumentTable> {
        schema::validate_table_name(table)?;
        self.inner.pool.router().resolve(&realm)?;
        if !self.inner.pool.layout(&realm).has_document_table(table) {
            return Err(StoreError::Validation(format!(
                "{table} is not a document table of realm {realm}"
            )));
        }
        Ok(DocumentTable {
            store: self.clone(),
            realm,
            table: Arc::from(table),
        })
    }

    /// Register a listener. The store keeps only a weak reference; a
    /// dropped listener is pruned on the next notification.
    pub fn add_listener(&self, listener: Weak<dyn ChangeListener>) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push(listener);
    }

    async fn notify(&self, change: DocumentChange) {
        let live: Vec<Arc<dyn ChangeListener>> = {
            let mut listeners = self
                .inner
                .listeners
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.document_changed(&change).await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  DocumentTable
// ═══════════════════════════════════════════════════════════════════════

/// Operations on one document table of one realm.
#[derive(Clone)]
pub struct DocumentTable {
    store: DocumentStore,
    realm: Realm,
    table: Arc<str>,
}

impl fmt::Debug for DocumentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTable")
            .field("realm", &self.realm)
            .field("table", &self.table)
            .finish()
    }
}

impl DocumentTable {
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn name(&self) -> &str {
        &self.table
    }

    /// Write a new current version of `uid`, historizing the previous one.
    #[instrument(skip(self, daten, opts), fields(realm = %self.realm, table = %self.table))]
    pub async fn put(&self, uid: &str, daten: Value, opts: PutOptions) -> StoreResult<Document> {
        self.write(uid, daten, opts, None).await
    }

    /// [`put`](Self::put) under a freshly generated UUID v7.
    pub async fn insert(&self, daten: Value, opts: PutOptions) -> StoreResult<Document> {
        let uid = Uuid::now_v7().to_string();
        self.put(&uid, daten, opts).await
    }

    /// Like [`put`](Self::put), but only if the current row's hash equals
    /// `expected_hash`. On mismatch nothing is written and
    /// [`StoreError::StaleWriteConflict`] is returned.
    #[instrument(skip(self, daten, opts), fields(realm = %self.realm, table = %self.table))]
    pub async fn cas_put(
        &self,
        uid: &str,
        expected_hash: &str,
        daten: Value,
        opts: PutOptions,
    ) -> StoreResult<Document> {
        self.write(uid, daten, opts, Some(expected_hash.to_string()))
            .await
    }

    /// The current version of `uid`.
    #[instrument(skip(self), fields(realm = %self.realm, table = %self.table))]
    pub async fn get_current(&self, uid: &str) -> StoreResult<Document> {
        let db = self.store.inner.pool.database(&self.realm).await?;
        let table = Arc::clone(&self.table);
        let uid = uid.to_string();
        db.read(move |conn| {
            select_current(conn, &table, &uid)?.ok_or_else(|| not_found(&table, &uid))
        })
        .await
    }

    /// All current rows matching `filter`, fetched lazily page by page.
    pub fn list_current(&self, filter: DocumentFilter) -> CurrentDocuments {
        CurrentDocuments {
            table: self.clone(),
            filter,
            page_size: self.store.inner.page_size,
        }
    }

    /// Retire the current version of `uid` without a replacement.
    #[instrument(skip(self), fields(realm = %self.realm, table = %self.table))]
    pub async fn historize(&self, uid: &str) -> StoreResult<()> {
        document::validate_uid(uid)?;
        let db = self.store.inner.pool.database(&self.realm).await?;
        let lock = self.store.inner.locks.lock(self.lock_key(uid)).await;

        let table = Arc::clone(&self.table);
        let owned_uid = uid.to_string();
        let generation = db
            .write(move |conn| {
                let _lock = lock;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                if select_current(&tx, &table, &owned_uid)?.is_none() {
                    return Err(not_found(&table, &owned_uid));
                }
                let chain = chain_state(&tx, &table, &owned_uid)?;
                let now = chain.clamp(Utc::now());
                let generation = chain.max_generation + 1;
                retire_current(&tx, &table, &owned_uid, generation, now)?;
                tx.commit()?;
                Ok(generation)
            })
            .await?;

        debug!(uid, generation, "document historized");
        self.store
            .notify(DocumentChange {
                realm: self.realm.clone(),
                table: self.table.to_string(),
                uid: uid.to_string(),
                kind: ChangeKind::Historized,
                source_hash: None,
            })
            .await;
        Ok(())
    }

    /// The version of `uid` that was valid at `at`.
    #[instrument(skip(self), fields(realm = %self.realm, table = %self.table))]
    pub async fn as_of(&self, uid: &str, at: DateTime<Utc>) -> StoreResult<Document> {
        let db = self.store.inner.pool.database(&self.realm).await?;
        let table = Arc::clone(&self.table);
        let uid = uid.to_string();
        db.read(move |conn| {
            let sql = format!(
                "SELECT {COLUMN_LIST} FROM {table} \
                 WHERE uid = ?1 AND created_at <= ?2 AND gilt_bis > ?2 \
                 ORDER BY historisch ASC LIMIT 1"
            );
            conn.query_row(&sql, rusqlite::params![uid, encode_timestamp(at)], |row| {
                Document::from_row(row)
            })
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "document version",
                id: format!("{table}/{uid}@{}", encode_timestamp(at)),
            })
        })
        .await
    }

    /// Every version of `uid`: the current row first (if any), then the
    /// retired rows from newest to oldest.
    #[instrument(skip(self), fields(realm = %self.realm, table = %self.table))]
    pub async fn history(&self, uid: &str) -> StoreResult<Vec<Document>> {
        let db = self.store.inner.pool.database(&self.realm).await?;
        let table = Arc::clone(&self.table);
        let uid = uid.to_string();
        db.read(move |conn| {
            let sql = format!(
                "SELECT {COLUMN_LIST} FROM {table} WHERE uid = ?1 \
                 ORDER BY historisch = 0 DESC, historisch DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([&uid], |row| Document::from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ── internals ────────────────────────────────────────────────────

    fn lock_key(&self, uid: &str) -> String {
        format!("{}/{}/{uid}", self.realm, self.table)
    }

    async fn write(
        &self,
        uid: &str,
        daten: Value,
        opts: PutOptions,
        expected_hash: Option<String>,
    ) -> StoreResult<Document> {
        document::validate_uid(uid)?;
        document::validate_daten(&daten)?;

        let db = self.store.inner.pool.database(&self.realm).await?;
        let lock = self.store.inner.locks.lock(self.lock_key(uid)).await;

        let table = Arc::clone(&self.table);
        let owned_uid = uid.to_string();
        let (doc, kind) = db
            .write(move |conn| {
                let _lock = lock;
                write_version(conn, &table, &owned_uid, daten, opts, expected_hash.as_deref())
            })
            .await
            .inspect_err(|err| {
                if err.is_stale_write() {
                    warn!(uid, "stale write rejected");
                }
            })?;

        debug!(uid, ?kind, source_hash = %doc.source_hash, "document written");
        self.store
            .notify(DocumentChange {
                realm: self.realm.clone(),
                table: self.table.to_string(),
                uid: doc.uid.clone(),
                kind,
                source_hash: Some(doc.source_hash.clone()),
            })
            .await;
        Ok(doc)
    }

    async fn fetch_page(
        &self,
        filter: &DocumentFilter,
        after: Option<String>,
        limit: u32,
    ) -> StoreResult<Vec<Document>> {
        let db = self.store.inner.pool.database(&self.realm).await?;
        let table = Arc::clone(&self.table);
        let name = filter.name.clone();
        let sec_id = filter.sec_id.clone();
        db.read(move |conn| {
            let sql = format!(
                "SELECT {COLUMN_LIST} FROM {table} \
                 WHERE historisch = 0 \
                   AND (?1 IS NULL OR uid > ?1) \
                   AND (?2 IS NULL OR name = ?2) \
                   AND (?3 IS NULL OR sec_id = ?3) \
                 ORDER BY uid LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![after, name, sec_id, limit], |row| {
                    Document::from_row(row)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Listing
// ═══════════════════════════════════════════════════════════════════════

/// A restartable query over the current rows of a table.
///
/// Nothing is read until [`stream`](Self::stream) is polled; every call to
/// `stream` starts over from the first row. Rows are fetched in pages
/// ordered by `uid`, so the sequence is finite even while writers are
/// active.
#[derive(Debug, Clone)]
pub struct CurrentDocuments {
    table: DocumentTable,
    filter: DocumentFilter,
    page_size: u32,
}

struct PageState {
    table: DocumentTable,
    filter: DocumentFilter,
    page_size: u32,
    cursor: Option<String>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl CurrentDocuments {
    pub fn filter(&self) -> &DocumentFilter {
        &self.filter
    }

    /// Override the page size of this listing.
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// A fresh stream over the matching documents.
    pub fn stream(&self) -> impl Stream<Item = StoreResult<Document>> + Send + 'static {
        let state = PageState {
            table: self.table.clone(),
            filter: self.filter.clone(),
            page_size: self.page_size,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };
        stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                if let Some(doc) = state.buffer.pop_front() {
                    return Some((Ok(doc), Some(state)));
                }
                if state.exhausted {
                    return None;
                }
                let page = state
                    .table
                    .fetch_page(&state.filter, state.cursor.clone(), state.page_size)
                    .await;
                match page {
                    Ok(page) => {
                        state.exhausted = page.len() < state.page_size as usize;
                        if let Some(last) = page.last() {
                            state.cursor = Some(last.uid.clone());
                        }
                        let filter = &state.filter;
                        let matched: Vec<Document> =
                            page.into_iter().filter(|d| filter.matches(d)).collect();
                        state.buffer.extend(matched);
                    }
                    Err(err) => return Some((Err(err), None)),
                }
            }
        })
    }

    /// Drain a fresh stream into a vector.
    pub async fn collect(&self) -> StoreResult<Vec<Document>> {
        self.stream().try_collect().await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SQL helpers (run on the blocking pool)
// ═══════════════════════════════════════════════════════════════════════

/// Generation counter and time floor of one uid's version chain.
struct ChainState {
    max_generation: i64,
    /// Latest instant already used by the chain: the current row's
    /// `created_at` or a retired row's `gilt_bis`.
    floor: Option<DateTime<Utc>>,
}

impl ChainState {
    /// Never hand out a timestamp earlier than the chain already uses, so
    /// validity windows stay ordered even if the clock steps back.
    fn clamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.floor {
            Some(floor) if floor > now => floor,
            _ => now,
        }
    }
}

fn not_found(table: &str, uid: &str) -> StoreError {
    StoreError::NotFound {
        entity: "document",
        id: format!("{table}/{uid}"),
    }
}

fn select_current(conn: &Connection, table: &str, uid: &str) -> StoreResult<Option<Document>> {
    let sql = format!("SELECT {COLUMN_LIST} FROM {table} WHERE uid = ?1 AND historisch = 0");
    let doc = conn
        .query_row(&sql, [uid], |row| Document::from_row(row))
        .optional()?;
    Ok(doc)
}

fn chain_state(conn: &Connection, table: &str, uid: &str) -> StoreResult<ChainState> {
    let sql = format!(
        "SELECT COALESCE(MAX(historisch), 0), \
                MAX(CASE WHEN historisch = 0 THEN created_at ELSE gilt_bis END) \
         FROM {table} WHERE uid = ?1"
    );
    let (max_generation, floor): (i64, Option<String>) =
        conn.query_row(&sql, [uid], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let floor = floor.as_deref().map(document::parse_timestamp).transpose()?;
    Ok(ChainState {
        max_generation,
        floor,
    })
}

fn retire_current(
    conn: &Connection,
    table: &str,
    uid: &str,
    generation: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let sql = format!(
        "UPDATE {table} SET historisch = ?2, gilt_bis = ?3, modified_at = ?3 \
         WHERE uid = ?1 AND historisch = 0"
    );
    let updated = conn.execute(&sql, rusqlite::params![uid, generation, encode_timestamp(now)])?;
    if updated != 1 {
        return Err(not_found(table, uid));
    }
    Ok(())
}

/// The historize-then-insert sequence shared by `put` and `cas_put`.
fn write_version(
    conn: &mut Connection,
    table: &str,
    uid: &str,
    daten: Value,
    opts: PutOptions,
    expected_hash: Option<&str>,
) -> StoreResult<(Document, ChangeKind)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = select_current(&tx, table, uid)?;

    if let Some(expected) = expected_hash {
        match &current {
            None => return Err(not_found(table, uid)),
            Some(cur) if cur.source_hash != expected => {
                return Err(StoreError::StaleWriteConflict {
                    table: table.to_string(),
                    uid: uid.to_string(),
                    expected: expected.to_string(),
                    actual: cur.source_hash.clone(),
                });
            }
            Some(_) => {}
        }
    }

    let chain = chain_state(&tx, table, uid)?;
    let now = chain.clamp(Utc::now());
    let source_hash = content_hash(&daten)?;

    let (name, sec_id, daten_backup, kind) = match current {
        Some(cur) => {
            retire_current(&tx, table, uid, chain.max_generation + 1, now)?;
            (
                opts.name.or(cur.name),
                opts.sec_id.or(cur.sec_id),
                cur.daten,
                ChangeKind::Updated,
            )
        }
        None => (opts.name, opts.sec_id, json!({}), ChangeKind::Created),
    };

    let stamp = encode_timestamp(now);
    let sql = format!(
        "INSERT INTO {table} ({COLUMN_LIST}) \
         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?7, ?8)"
    );
    tx.execute(
        &sql,
        rusqlite::params![
            uid,
            serde_json::to_string(&daten)?,
            name,
            source_hash,
            sec_id,
            FAR_FUTURE,
            stamp,
            serde_json::to_string(&daten_backup)?,
        ],
    )?;
    tx.commit()?;

    let doc = Document {
        uid: uid.to_string(),
        daten,
        name,
        historisch: 0,
        source_hash,
        sec_id,
        gilt_bis: far_future(),
        created_at: now,
        modified_at: now,
        daten_backup,
    };
    Ok((doc, kind))
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TablesConfig;
    use crate::db::DatabaseOptions;
    use crate::realm::{ConnectionTarget, RealmRouter};
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;

    fn store() -> DocumentStore {
        let router = RealmRouter::builder()
            .identity(ConnectionTarget::memory("identity"))
            .system(ConnectionTarget::memory("system"))
            .tenant("acme", ConnectionTarget::memory("acme"))
            .build();
        let pool = ConnectionPool::new(router, &TablesConfig::default(), DatabaseOptions::default());
        DocumentStore::new(pool)
    }

    fn menus(store: &DocumentStore) -> DocumentTable {
        store.table(Realm::System, "menuedaten").unwrap()
    }

    async fn tick() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    #[tokio::test]
    async fn put_then_get_current() {
        let store = store();
        let t = menus(&store);
        let doc = t
            .put("haupt", json!({"items": ["a"]}), PutOptions::named("Hauptmenü"))
            .await
            .unwrap();
        assert_eq!(doc.historisch, 0);
        assert_eq!(doc.daten_backup, json!({}));
        assert_eq!(doc.gilt_bis, far_future());
        assert_eq!(doc.source_hash, content_hash(&json!({"items": ["a"]})).unwrap());

        let current = t.get_current("haupt").await.unwrap();
        assert_eq!(current, doc);
    }

    #[tokio::test]
    async fn get_current_missing_is_not_found() {
        let store = store();
        let err = menus(&store).get_current("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn second_put_historizes_first() {
        let store = store();
        let t = menus(&store);
        let d1 = t.put("m", json!({"v": 1}), PutOptions::named("menu")).await.unwrap();
        tick().await;
        let d2 = t.put("m", json!({"v": 2}), PutOptions::default()).await.unwrap();

        assert_eq!(d2.daten_backup, json!({"v": 1}));
        // Metadata carried over when not given.
        assert_eq!(d2.name.as_deref(), Some("menu"));
        assert!(d2.created_at > d1.created_at);

        let history = t.history("m").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].historisch, 0);
        assert_eq!(history[0].daten, json!({"v": 2}));
        assert_eq!(history[1].historisch, 1);
        assert_eq!(history[1].daten, json!({"v": 1}));
        assert_eq!(history[1].gilt_bis, d2.created_at);
        assert!(history[1].created_at <= history[1].modified_at);
    }

    #[tokio::test]
    async fn as_of_reconstructs_versions() {
        let store = store();
        let t = menus(&store);
        let d1 = t.put("m", json!({"v": 1}), PutOptions::default()).await.unwrap();
        tick().await;
        let d2 = t.put("m", json!({"v": 2}), PutOptions::default()).await.unwrap();

        assert_eq!(t.as_of("m", d1.created_at).await.unwrap().daten, json!({"v": 1}));
        assert_eq!(t.as_of("m", d2.created_at).await.unwrap().daten, json!({"v": 2}));
        assert_eq!(t.as_of("m", Utc::now()).await.unwrap().daten, json!({"v": 2}));

        let before = d1.created_at - chrono::Duration::seconds(1);
        assert!(t.as_of("m", before).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn historize_retires_without_replacement() {
        let store = store();
        let t = menus(&store);
        let d1 = t.put("m", json!({"v": 1}), PutOptions::default()).await.unwrap();
        tick().await;
        t.historize("m").await.unwrap();

        assert!(t.get_current("m").await.unwrap_err().is_not_found());
        assert!(t.historize("m").await.unwrap_err().is_not_found());
        assert_eq!(t.as_of("m", d1.created_at).await.unwrap().historisch, 1);
        assert!(t.as_of("m", Utc::now()).await.unwrap_err().is_not_found());

        // A later put starts a new current row; generations keep counting.
        tick().await;
        let d3 = t.put("m", json!({"v": 3}), PutOptions::default()).await.unwrap();
        assert_eq!(d3.daten_backup, json!({}));
        tick().await;
        t.put("m", json!({"v": 4}), PutOptions::default()).await.unwrap();
        let generations: Vec<i64> = t
            .history("m")
            .await
            .unwrap()
            .iter()
            .map(|d| d.historisch)
            .collect();
        assert_eq!(generations, vec![0, 2, 1]);
    }

    #[tokio::test]
    async fn cas_put_checks_hash() {
        let store = store();
        let t = menus(&store);
        let d1 = t.put("m", json!({"v": 1}), PutOptions::default()).await.unwrap();

        let d2 = t
            .cas_put("m", &d1.source_hash, json!({"v": 2}), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(d2.daten, json!({"v": 2}));

        // d1's hash is stale now.
        let err = t
            .cas_put("m", &d1.source_hash, json!({"v": 3}), PutOptions::default())
            .await
            .unwrap_err();
        match err {
            StoreError::StaleWriteConflict { expected, actual, .. } => {
                assert_eq!(expected, d1.source_hash);
                assert_eq!(actual, d2.source_hash);
            }
            other => panic!("expected stale write, got {other}"),
        }
        assert_eq!(t.history("m").await.unwrap().len(), 2);
        assert_eq!(t.get_current("m").await.unwrap(), d2);

        let missing = t
            .cas_put("other", "x", json!({}), PutOptions::default())
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let store = store();
        let t = menus(&store);
        for bad in [Value::Null, json!(1), json!("s")] {
            let err = t.put("m", bad, PutOptions::default()).await.unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)));
        }
        let err = t.put("  ", json!({}), PutOptions::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        assert!(matches!(
            store.table(Realm::System, "benutzer_einstellungen"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.table(Realm::System, "x; drop"),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.table(Realm::tenant("globex"), "mandantendaten"),
            Err(StoreError::UnknownRealm(_))
        ));
    }

    #[tokio::test]
    async fn insert_generates_uid() {
        let store = store();
        let t = menus(&store);
        let a = t.insert(json!({"n": 1}), PutOptions::default()).await.unwrap();
        let b = t.insert(json!({"n": 2}), PutOptions::default()).await.unwrap();
        assert_ne!(a.uid, b.uid);
        assert!(Uuid::parse_str(&a.uid).is_ok());
    }

    #[tokio::test]
    async fn list_current_pages_and_filters() {
        let store = store();
        let t = menus(&store);
        for i in 0..7 {
            let sec = if i % 2 == 0 { "acme" } else { "globex" };
            let typ = if i < 3 { "kopf" } else { "fuss" };
            t.put(
                &format!("m{i}"),
                json!({"nr": i, "typ": typ}),
                PutOptions::default().sec_id(sec),
            )
            .await
            .unwrap();
        }
        // A historized version must never be listed.
        t.put("m0", json!({"nr": 0, "typ": "kopf", "rev": 2}), PutOptions::default())
            .await
            .unwrap();

        let all = t.list_current(DocumentFilter::new()).page_size(2);
        let docs = all.collect().await.unwrap();
        assert_eq!(docs.len(), 7);
        assert!(docs.iter().all(Document::is_current));
        let uids: Vec<&str> = docs.iter().map(|d| d.uid.as_str()).collect();
        assert_eq!(uids, ["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);

        // Restartable: a second stream sees the same rows.
        assert_eq!(all.stream().count().await, 7);

        let acme_kopf = t
            .list_current(
                DocumentFilter::new()
                    .sec_id("acme")
                    .daten(crate::document::DatenMatch::Contains(json!({"typ": "kopf"}))),
            )
            .page_size(3)
            .collect()
            .await
            .unwrap();
        let uids: Vec<&str> = acme_kopf.iter().map(|d| d.uid.as_str()).collect();
        assert_eq!(uids, ["m0", "m2"]);
    }

    struct Recorder(Mutex<Vec<DocumentChange>>);

    #[async_trait]
    impl ChangeListener for Recorder {
        async fn document_changed(&self, change: &DocumentChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    #[tokio::test]
    async fn listeners_see_committed_changes() {
        let store = store();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn ChangeListener> =
            Arc::downgrade(&(Arc::clone(&recorder) as Arc<dyn ChangeListener>));
        store.add_listener(weak);

        let t = menus(&store);
        t.put("m", json!({}), PutOptions::default()).await.unwrap();
        t.put("m", json!({"a": 1}), PutOptions::default()).await.unwrap();
        let _ = t
            .cas_put("m", "wrong", json!({}), PutOptions::default())
            .await
            .unwrap_err();
        t.historize("m").await.unwrap();

        let kinds: Vec<ChangeKind> = recorder.0.lock().unwrap().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            [ChangeKind::Created, ChangeKind::Updated, ChangeKind::Historized]
        );
        assert_eq!(recorder.0.lock().unwrap()[0].realm, Realm::System);

        drop(recorder);
        // Dropped listeners are pruned silently.
        t.put("m", json!({}), PutOptions::default()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_do_not_lose_updates() {
        let store = store();
        let t = menus(&store);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let t = t.clone();
                tokio::spawn(async move {
                    t.put("shared", json!({"writer": i}), PutOptions::default())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = t.history("shared").await.unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history.iter().filter(|d| d.is_current()).count(), 1);

        let mut generations: Vec<i64> = history.iter().map(|d| d.historisch).collect();
        generations.sort();
        assert_eq!(generations, (0..20).collect::<Vec<_>>());

        let mut writers: Vec<i64> = history
            .iter()
            .map(|d| d.daten["writer"].as_i64().unwrap())
            .collect();
        writers.sort();
        assert_eq!(writers, (0..20).collect::<Vec<_>>());

        // Each version's backup is exactly the payload of the version it
        // replaced.
        for pair in history[1..].windows(2) {
            assert_eq!(pair[0].daten_backup, pair[1].daten);
        }
        assert_eq!(history[0].daten_backup, history[1].daten);
    }
}
