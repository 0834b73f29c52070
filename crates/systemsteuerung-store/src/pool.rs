//! Connection pool shared by every realm.
//!
//! Databases are opened lazily, once per [`ConnectionTarget`], and
//! provisioned once per (target, realm kind) the first time a realm routed
//! to them is used. Concurrent first uses of a target wait on the same
//! open instead of racing to create the file twice.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{SteuerungConfig, TablesConfig};
use crate::db::{Database, DatabaseOptions};
use crate::error::StoreResult;
use crate::realm::{ConnectionTarget, Realm, RealmKind, RealmRouter};
use crate::schema::RealmLayout;

/// Lazily-opened databases keyed by connection target.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    router: RealmRouter,
    layouts: HashMap<RealmKind, RealmLayout>,
    options: DatabaseOptions,
    databases: DashMap<ConnectionTarget, Arc<OnceCell<Database>>>,
    provisioned: DashMap<(ConnectionTarget, RealmKind), Arc<OnceCell<()>>>,
}

impl ConnectionPool {
    /// Create a pool over `router` with the given table layout.
    pub fn new(router: RealmRouter, tables: &TablesConfig, options: DatabaseOptions) -> Self {
        let layouts = [RealmKind::Identity, RealmKind::System, RealmKind::Tenant]
            .into_iter()
            .map(|kind| (kind, RealmLayout::for_kind(kind, tables)))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                router,
                layouts,
                options,
                databases: DashMap::new(),
                provisioned: DashMap::new(),
            }),
        }
    }

    /// Build router and pool from a validated configuration.
    pub fn from_config(config: &SteuerungConfig) -> StoreResult<Self> {
        config.validate()?;
        let router = RealmRouter::from_config(&config.realms);
        let options = DatabaseOptions {
            read_connections: config.database.read_connections,
            busy_timeout_ms: config.database.busy_timeout_ms,
        };
        Ok(Self::new(router, &config.tables, options))
    }

    /// The router this pool resolves realms with.
    pub fn router(&self) -> &RealmRouter {
        &self.inner.router
    }

    /// The table layout of `realm`.
    pub fn layout(&self, realm: &Realm) -> &RealmLayout {
        // Every kind is inserted in `new`.
        &self.inner.layouts[&realm.kind()]
    }

    /// The provisioned database holding `realm`.
    pub async fn database(&self, realm: &Realm) -> StoreResult<Database> {
        let target = self.inner.router.resolve(realm)?.clone();
        let db = self.open_target(&target).await?;

        let kind = realm.kind();
        let cell = self
            .inner
            .provisioned
            .entry((target.clone(), kind))
            .or_default()
            .clone();
        cell.get_or_try_init(|| async {
            db.provision(self.layout(realm).clone()).await?;
            info!(%realm, %target, "realm provisioned");
            Ok::<_, crate::error::StoreError>(())
        })
        .await?;

        Ok(db)
    }

    /// Number of physical databases opened so far.
    pub fn open_count(&self) -> usize {
        self.inner
            .databases
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    async fn open_target(&self, target: &ConnectionTarget) -> StoreResult<Database> {
        let cell = self.inner.databases.entry(target.clone()).or_default().clone();
        let options = self.inner.options;
        let db = cell
            .get_or_try_init(|| async {
                debug!(%target, "opening connection target");
                match target.clone() {
                    ConnectionTarget::File(path) => {
                        tokio::task::spawn_blocking(move || Database::open(path, options)).await?
                    }
                    ConnectionTarget::Memory(_) => Database::open_in_memory(),
                }
            })
            .await?;
        Ok(db.clone())
    }
}
