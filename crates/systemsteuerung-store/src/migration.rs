//! Realm provisioning.
//!
//! Migrations render their SQL from the [`RealmLayout`] of the realm being
//! opened. Applied versions are tracked per realm kind in a `_migrations`
//! table so each step only runs once.
//!
//! The layout itself comes from configuration and may grow between runs
//! (a new `tenant_extra` table, a renamed settings table). Its tables are
//! therefore reconciled on every provision with `CREATE ... IF NOT EXISTS`,
//! independent of the recorded version.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::schema::{self, Dialect, RealmLayout};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Renders the SQL for a layout, or `None` if the step does not apply.
    render: fn(&RealmLayout) -> Option<String>,
}

/// Version of the last entry in [`MIGRATIONS`].
const LATEST_VERSION: u32 = 2;

/// All migrations in order. Add new migrations to the end of this array.
/// Every step must be idempotent DDL: [`run_all`] replays them to pick up
/// tables added to the layout after the realm was first provisioned.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "canonical document tables and standard indexes",
        render: document_tables,
    },
    Migration {
        version: 2,
        description: "user identity table",
        render: identity_table,
    },
];

fn document_tables(layout: &RealmLayout) -> Option<String> {
    Some(layout.document_tables_sql(Dialect::Sqlite))
}

fn identity_table(layout: &RealmLayout) -> Option<String> {
    layout
        .identity_table
        .as_deref()
        .map(|t| schema::create_identity_table_sql(t, Dialect::Sqlite))
}

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations for `layout` against `conn`.
///
/// This is a **synchronous** function; call it from `spawn_blocking`.
pub fn run_all(conn: &Connection, layout: &RealmLayout) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let scope = layout.kind.as_str();
    let current = current_version(conn, scope)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(scope, current_version = current, "realm schema is up to date");
    } else {
        info!(
            scope,
            current_version = current,
            pending = pending.len(),
            "provisioning realm"
        );
        for migration in pending {
            apply(conn, scope, layout, migration)?;
        }
    }

    reconcile_layout(conn, layout)
}

/// Create any table of `layout` that is missing, whatever version the
/// realm is at.
fn reconcile_layout(conn: &Connection, layout: &RealmLayout) -> StoreResult<()> {
    let sql = MIGRATIONS
        .iter()
        .filter_map(|m| (m.render)(layout))
        .collect::<Vec<_>>()
        .join("\n");
    conn.execute_batch(&sql).map_err(|e| StoreError::Migration {
        version: LATEST_VERSION,
        message: format!("failed to reconcile realm layout: {e}"),
    })?;
    debug!(
        scope = layout.kind.as_str(),
        tables = layout.document_tables.len(),
        "realm layout reconciled"
    );
    Ok(())
}

/// Return the latest applied migration version for `scope`, or 0 if none.
pub fn current_version(conn: &Connection, scope: &str) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations WHERE scope = ?1",
            [scope],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            scope       TEXT NOT NULL,
            version     INTEGER NOT NULL,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL,
            PRIMARY KEY (scope, version)
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(
    conn: &Connection,
    scope: &str,
    layout: &RealmLayout,
    migration: &Migration,
) -> StoreResult<()> {
    let sql = (migration.render)(layout);
    debug!(
        scope,
        version = migration.version,
        description = migration.description,
        applies = sql.is_some(),
        "applying migration"
    );

    // `&Connection` only, so the transaction is managed by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        if let Some(sql) = &sql {
            conn.execute_batch(sql).map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;
        }

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (scope, version, description, applied_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![scope, migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(scope, version = migration.version, "migration applied");
        }
        Err(err) => {
            warn!(scope, version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────
