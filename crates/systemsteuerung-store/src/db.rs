//! SQLite database handle with WAL mode and performance pragmas.
//!
//! The [`Database`] struct owns one writer `rusqlite::Connection` and, for
//! file-backed databases, a small set of read-only connections. Every call
//! is dispatched with `tokio::task::spawn_blocking` so the async runtime is
//! never blocked on SQLite.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;
use crate::schema::RealmLayout;

/// Connection settings applied when a database is opened.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    /// Read-only connections for file-backed databases.
    pub read_connections: usize,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            read_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Thread-safe handle to a SQLite database.
///
/// Reads go through [`Database::read`], which uses a reader connection when
/// one exists so WAL readers never queue behind the writer. Writes go
/// through [`Database::write`] on the single writer connection.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup or
    /// wrap it in `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), readers = options.read_connections, "opening database");

        let writer = Connection::open(path).map_err(|e| connection_error(path, e))?;
        Self::apply_pragmas(&writer, options)?;

        let mut readers = Vec::with_capacity(options.read_connections);
        for _ in 0..options.read_connections {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| connection_error(path, e))?;
            reader.pragma_update(None, "busy_timeout", options.busy_timeout_ms)?;
            // Reader slots must never take the write lock.
            reader.pragma_update(None, "query_only", true)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create an in-memory database. Reads share the writer connection.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn, DatabaseOptions::default())?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Provision the tables of `layout` (idempotent).
    pub async fn provision(&self, layout: RealmLayout) -> StoreResult<()> {
        self.write(move |conn| migration::run_all(conn, &layout)).await
    }

    /// Run a read-only closure on the blocking pool.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.read(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM layouts", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.readers.is_empty() {
            return self.write(|conn| f(conn)).await;
        }

        let readers = Arc::clone(&self.readers);
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let conn = readers[slot]
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Run a closure against the writer connection on the blocking pool.
    ///
    /// The closure receives a `&mut Connection` so it can open a
    /// transaction.
    pub async fn write<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// Number of dedicated reader connections.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection, options: DatabaseOptions) -> StoreResult<()> {
        // WAL mode: readers do not block the writer and vice versa.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL, only the last transaction can be
        // lost on power failure.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;
        conn.pragma_update(None, "cache_size", -64_000_i32)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "busy_timeout", options.busy_timeout_ms)?;

        debug!("database pragmas applied");
        Ok(())
    }
}

fn connection_error(path: &Path, err: rusqlite::Error) -> StoreError {
    StoreError::Connection {
        target: format!("file:{}", path.display()),
        message: err.to_string(),
    }
}

// ── tests ────────────────────────────────────────────────────────────
