//! Error types for the systemsteuerung-store crate.
//!
//! All store, router, and cache operations return [`StoreError`] via
//! [`StoreResult`]. Uses `thiserror` for the variant definitions.

use std::sync::Arc;

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the document store, router, or session cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database behind a connection target could not be opened or
    /// reached.
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A provisioning migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// No current (or temporally matching) row exists.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The current row's hash no longer matches the caller's expectation.
    #[error("stale write to {table}/{uid}: expected hash {expected}, found {actual}")]
    StaleWriteConflict {
        table: String,
        uid: String,
        expected: String,
        actual: String,
    },

    /// A payload, table name, or identifier failed structural checks.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The router has no mapping for the logical realm name.
    #[error("unknown realm: {0}")]
    UnknownRealm(String),

    /// A path lookup inside a cached configuration document missed.
    #[error("key not found: {path}")]
    KeyNotFound { path: String },

    /// The configuration is malformed or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// An error produced by a single load and shared by every waiter on it.
    #[error(transparent)]
    Shared(Arc<StoreError>),
}

impl StoreError {
    /// Take ownership of a shared error when this is the last reference,
    /// otherwise wrap it.
    pub fn from_shared(err: Arc<StoreError>) -> Self {
        Arc::try_unwrap(err).unwrap_or_else(Self::Shared)
    }

    /// The underlying error, looking through [`StoreError::Shared`].
    pub fn root(&self) -> &StoreError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// `true` for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    /// `true` for [`StoreError::StaleWriteConflict`].
    pub fn is_stale_write(&self) -> bool {
        matches!(self.root(), Self::StaleWriteConflict { .. })
    }

    /// `true` for transport-level failures: unreachable databases and
    /// SQLite busy/locked/cannot-open conditions.
    pub fn is_connection_error(&self) -> bool {
        match self.root() {
            Self::Connection { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
