//! Canonical document table schema.
//!
//! Every document table, in every realm, has the same column set and the
//! same index set. This module publishes both as plain data and renders
//! them as DDL for SQLite (used by the store itself) and PostgreSQL (for
//! external provisioning tools).
//!
//! The user identity table is the one exception: it lives in the identity
//! realm and has its own small column set.

use serde::{Deserialize, Serialize};

use crate::config::TablesConfig;
use crate::error::{StoreError, StoreResult};
use crate::realm::RealmKind;

// ── table names ──────────────────────────────────────────────────────

/// Default name of the user identity table.
pub const IDENTITY_TABLE: &str = "benutzer";

/// Default name of the per-user settings table.
pub const SETTINGS_TABLE: &str = "benutzer_einstellungen";

/// Default name of the tenant application data table.
pub const TENANT_DATA_TABLE: &str = "mandantendaten";

/// Tables that must exist in the shared system realm.
pub const SYSTEM_TABLES: &[&str] = &[
    "beschreibungen",
    "dropdowndaten",
    "menuedaten",
    "dialogdaten",
    "viewdaten",
    "framedaten",
    "layouts",
];

/// `gilt_bis` of a current row.
pub const FAR_FUTURE: &str = "9999-12-31 23:59:59.000000";

// ── columns ──────────────────────────────────────────────────────────

/// Logical column type, rendered per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Identifier,
    Json,
    Text,
    Integer,
    Timestamp,
}

/// Column default, rendered per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    None,
    GeneratedId,
    Zero,
    EmptyObject,
    Now,
    FarFuture,
}

/// One column of the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub default: ColumnDefault,
}

const fn column(
    name: &'static str,
    ty: ColumnType,
    nullable: bool,
    default: ColumnDefault,
) -> Column {
    Column {
        name,
        ty,
        nullable,
        default,
    }
}

/// The canonical column set, in table order.
pub const COLUMNS: &[Column] = &[
    column("uid", ColumnType::Identifier, false, ColumnDefault::GeneratedId),
    column("daten", ColumnType::Json, false, ColumnDefault::None),
    column("name", ColumnType::Text, true, ColumnDefault::None),
    column("historisch", ColumnType::Integer, false, ColumnDefault::Zero),
    column("source_hash", ColumnType::Text, true, ColumnDefault::None),
    column("sec_id", ColumnType::Identifier, true, ColumnDefault::None),
    column("gilt_bis", ColumnType::Timestamp, false, ColumnDefault::FarFuture),
    column("created_at", ColumnType::Timestamp, false, ColumnDefault::Now),
    column("modified_at", ColumnType::Timestamp, false, ColumnDefault::Now),
    column("daten_backup", ColumnType::Json, false, ColumnDefault::EmptyObject),
];

/// Comma-separated column list in canonical order, for `SELECT`s.
pub const COLUMN_LIST: &str = "uid, daten, name, historisch, source_hash, sec_id, \
                               gilt_bis, created_at, modified_at, daten_backup";

// ── indexes ──────────────────────────────────────────────────────────

/// How an index is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Ordinary ordered index.
    BTree,
    /// Containment/search index over the JSON payload.
    Containment,
}

/// One entry of the standard index set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub column: &'static str,
    pub kind: IndexKind,
}

/// Indexes created on every document table.
pub const INDEXES: &[IndexSpec] = &[
    IndexSpec { column: "sec_id", kind: IndexKind::BTree },
    IndexSpec { column: "historisch", kind: IndexKind::BTree },
    IndexSpec { column: "name", kind: IndexKind::BTree },
    IndexSpec { column: "modified_at", kind: IndexKind::BTree },
    IndexSpec { column: "daten", kind: IndexKind::Containment },
];

// ── dialects ─────────────────────────────────────────────────────────

/// SQL dialect for DDL rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl ColumnType {
    fn sql(self, dialect: Dialect) -> &'static str {
        match (dialect, self) {
            (Dialect::Sqlite, Self::Integer) => "INTEGER",
            (Dialect::Sqlite, _) => "TEXT",
            (Dialect::Postgres, Self::Identifier) => "TEXT",
            (Dialect::Postgres, Self::Json) => "JSONB",
            (Dialect::Postgres, Self::Text) => "TEXT",
            (Dialect::Postgres, Self::Integer) => "INTEGER",
            (Dialect::Postgres, Self::Timestamp) => "TIMESTAMP",
        }
    }
}

impl ColumnDefault {
    fn sql(self, dialect: Dialect) -> Option<&'static str> {
        match (dialect, self) {
            (_, Self::None) => None,
            (_, Self::Zero) => Some("0"),
            (Dialect::Sqlite, Self::GeneratedId) => Some("(lower(hex(randomblob(16))))"),
            (Dialect::Postgres, Self::GeneratedId) => Some("(gen_random_uuid()::text)"),
            (Dialect::Sqlite, Self::EmptyObject) => Some("'{}'"),
            (Dialect::Postgres, Self::EmptyObject) => Some("'{}'::jsonb"),
            (Dialect::Sqlite, Self::Now) => Some("(strftime('%Y-%m-%d %H:%M:%f', 'now'))"),
            (Dialect::Postgres, Self::Now) => Some("now()"),
            (Dialect::Sqlite, Self::FarFuture) => Some("'9999-12-31 23:59:59.000000'"),
            (Dialect::Postgres, Self::FarFuture) => Some("'9999-12-31 23:59:59'"),
        }
    }
}

/// Reject anything that is not a plain SQL identifier. Table names are
/// interpolated into statements, so this is the only gate against
/// injection.
pub fn validate_table_name(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || name.len() > 63 {
        return Err(StoreError::Validation(format!(
            "invalid table name: {name:?}"
        )));
    }
    if name.starts_with("sqlite_") || name.starts_with("_migrations") {
        return Err(StoreError::Validation(format!(
            "reserved table name: {name:?}"
        )));
    }
    Ok(())
}

/// `CREATE TABLE` plus all standard indexes for one document table.
pub fn create_table_sql(table: &str, dialect: Dialect) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {table} (\n");
    for col in COLUMNS {
        sql.push_str("    ");
        sql.push_str(col.name);
        sql.push(' ');
        sql.push_str(col.ty.sql(dialect));
        if !col.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = col.default.sql(dialect) {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql.push_str(",\n");
    }
    sql.push_str("    PRIMARY KEY (uid, historisch)\n);\n");

    sql.push_str(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_current \
         ON {table}(uid) WHERE historisch = 0;\n"
    ));
    for index in INDEXES {
        let column = index.column;
        let line = match (dialect, index.kind) {
            (Dialect::Postgres, IndexKind::Containment) => format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} \
                 ON {table} USING GIN ({column} jsonb_path_ops);\n"
            ),
            _ => format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column});\n"
            ),
        };
        sql.push_str(&line);
    }
    sql
}

/// `CREATE TABLE` for the identity table.
pub fn create_identity_table_sql(table: &str, dialect: Dialect) -> String {
    let now = ColumnDefault::Now.sql(dialect).unwrap_or("CURRENT_TIMESTAMP");
    let ts = ColumnType::Timestamp.sql(dialect);
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    \
             uid        TEXT PRIMARY KEY,\n    \
             login      TEXT NOT NULL UNIQUE,\n    \
             sec_id     TEXT,\n    \
             created_at {ts} NOT NULL DEFAULT {now}\n\
         );\n"
    )
}

// ── realm layouts ────────────────────────────────────────────────────

/// Which tables one realm kind holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmLayout {
    pub kind: RealmKind,
    /// Document tables following the canonical schema.
    pub document_tables: Vec<String>,
    /// The identity table, present in the identity realm only.
    pub identity_table: Option<String>,
}

impl RealmLayout {
    /// Derive the layout of `kind` from the table configuration.
    pub fn for_kind(kind: RealmKind, tables: &TablesConfig) -> Self {
        match kind {
            RealmKind::Identity => Self {
                kind,
                document_tables: vec![tables.settings.clone()],
                identity_table: Some(tables.identity.clone()),
            },
            RealmKind::System => Self {
                kind,
                document_tables: SYSTEM_TABLES.iter().map(|t| t.to_string()).collect(),
                identity_table: None,
            },
            RealmKind::Tenant => {
                let mut document_tables = vec![tables.tenant_data.clone()];
                document_tables.extend(tables.tenant_extra.iter().cloned());
                Self {
                    kind,
                    document_tables,
                    identity_table: None,
                }
            }
        }
    }

    /// Whether `table` is a document table of this layout.
    pub fn has_document_table(&self, table: &str) -> bool {
        self.document_tables.iter().any(|t| t == table)
    }

    /// DDL for every document table of the layout.
    pub fn document_tables_sql(&self, dialect: Dialect) -> String {
        self.document_tables
            .iter()
            .map(|t| create_table_sql(t, dialect))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
