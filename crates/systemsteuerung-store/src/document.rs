//! Versioned document rows and their helpers.
//!
//! A [`Document`] is one row of a canonical table: either the current
//! version of an entity (`historisch == 0`) or one of its retired versions.

use chrono::{DateTime, NaiveDateTime, Utc};
use ring::digest;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::schema::FAR_FUTURE;

/// Storage format of every timestamp column. Fixed width, so text
/// comparison in SQL orders the same as time.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One version of a stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Entity identifier, shared by all versions.
    pub uid: String,
    /// JSON payload.
    pub daten: Value,
    /// Optional label / secondary lookup key.
    pub name: Option<String>,
    /// 0 for the current version, N for the Nth retired version.
    pub historisch: i64,
    /// SHA-256 of `daten`, see [`content_hash`].
    pub source_hash: String,
    /// Security/tenant scoping identifier.
    pub sec_id: Option<String>,
    /// End of the validity window (exclusive).
    pub gilt_bis: DateTime<Utc>,
    /// Start of the validity window: when this version was written.
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Payload before the mutation that produced this version.
    pub daten_backup: Value,
}

impl Document {
    /// Whether this is the live version.
    pub fn is_current(&self) -> bool {
        self.historisch == 0
    }

    /// Whether `at` falls inside `[created_at, gilt_bis)`.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.created_at <= at && at < self.gilt_bis
    }

    /// Map a row selected with [`crate::schema::COLUMN_LIST`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let daten: String = row.get(1)?;
        let gilt_bis: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let modified_at: String = row.get(8)?;
        let backup: String = row.get(9)?;
        Ok(Self {
            uid: row.get(0)?,
            daten: parse_json_column(1, &daten)?,
            name: row.get(2)?,
            historisch: row.get(3)?,
            source_hash: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            sec_id: row.get(5)?,
            gilt_bis: parse_timestamp_column(6, &gilt_bis)?,
            created_at: parse_timestamp_column(7, &created_at)?,
            modified_at: parse_timestamp_column(8, &modified_at)?,
            daten_backup: parse_json_column(9, &backup)?,
        })
    }
}

/// Optional metadata for a write.
///
/// `None` keeps the value of the version being replaced (and means "absent"
/// on first insert).
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub name: Option<String>,
    pub sec_id: Option<String>,
}

impl PutOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            sec_id: None,
        }
    }

    pub fn sec_id(mut self, sec_id: impl Into<String>) -> Self {
        self.sec_id = Some(sec_id.into());
        self
    }
}

/// Predicate over the JSON payload used by `list_current`.
#[derive(Debug, Clone, PartialEq)]
pub enum DatenMatch {
    /// The payload contains the given value: objects match when every
    /// key of the pattern is present with a containing value, arrays when
    /// every pattern element is contained in some element, scalars when
    /// equal.
    Contains(Value),
    /// The payload equals the given value exactly.
    Equals(Value),
    /// Case-insensitive substring search over the serialized payload.
    Text(String),
}

impl DatenMatch {
    pub fn matches(&self, daten: &Value) -> bool {
        match self {
            Self::Contains(pattern) => json_contains(daten, pattern),
            Self::Equals(expected) => daten == expected,
            Self::Text(needle) => daten
                .to_string()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }
}

/// Filter for `list_current`. Empty filter matches every current row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    pub name: Option<String>,
    pub sec_id: Option<String>,
    pub daten: Option<DatenMatch>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn sec_id(mut self, sec_id: impl Into<String>) -> Self {
        self.sec_id = Some(sec_id.into());
        self
    }

    pub fn daten(mut self, predicate: DatenMatch) -> Self {
        self.daten = Some(predicate);
        self
    }

    /// Full check, including the columns already filtered in SQL.
    pub fn matches(&self, doc: &Document) -> bool {
        self.name.as_ref().is_none_or(|n| doc.name.as_ref() == Some(n))
            && self.sec_id.as_ref().is_none_or(|s| doc.sec_id.as_ref() == Some(s))
            && self.daten.as_ref().is_none_or(|p| p.matches(&doc.daten))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Fingerprint of a payload: lowercase hex SHA-256 of its compact JSON
/// serialization. Object keys serialize sorted, so equal values hash equal.
pub fn content_hash(daten: &Value) -> StoreResult<String> {
    let bytes = serde_json::to_vec(daten)?;
    let hash = digest::digest(&digest::SHA256, &bytes);
    Ok(hash.as_ref().iter().map(|b| format!("{b:02x}")).collect())
}

/// Payloads must be structured: a JSON object or array.
pub fn validate_daten(daten: &Value) -> StoreResult<()> {
    match daten {
        Value::Object(_) | Value::Array(_) => Ok(()),
        Value::Null => Err(StoreError::Validation("daten must not be null".into())),
        other => Err(StoreError::Validation(format!(
            "daten must be a JSON object or array, got {other}"
        ))),
    }
}

/// Parse raw text as a payload and validate it.
pub fn parse_daten(raw: &str) -> StoreResult<Value> {
    let daten: Value = serde_json::from_str(raw)
        .map_err(|e| StoreError::Validation(format!("daten is not valid JSON: {e}")))?;
    validate_daten(&daten)?;
    Ok(daten)
}

pub(crate) fn validate_uid(uid: &str) -> StoreResult<()> {
    if uid.trim().is_empty() {
        return Err(StoreError::Validation("uid must not be empty".into()));
    }
    Ok(())
}

/// PostgreSQL `@>`-style containment.
pub fn json_contains(haystack: &Value, pattern: &Value) -> bool {
    match (haystack, pattern) {
        (Value::Object(doc), Value::Object(pat)) => pat
            .iter()
            .all(|(k, v)| doc.get(k).is_some_and(|d| json_contains(d, v))),
        (Value::Array(doc), Value::Array(pat)) => pat
            .iter()
            .all(|p| doc.iter().any(|d| json_contains(d, p))),
        (Value::Array(doc), scalar) if !scalar.is_object() => {
            doc.iter().any(|d| d == scalar)
        }
        (doc, pat) => doc == pat,
    }
}

pub(crate) fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| StoreError::Validation(format!("invalid timestamp {raw:?}: {e}")))
}

/// The `gilt_bis` of a current row.
pub fn far_future() -> DateTime<Utc> {
    // The constant is a well-formed timestamp, checked in tests.
    parse_timestamp(FAR_FUTURE).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn parse_json_column(idx: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp_column(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ── tests ────────────────────────────────────────────────────────────
