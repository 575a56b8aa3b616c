//! Consumer-side SQLite store.
//!
//! Runtime pragmas:
//! - `journal_mode = WAL` so readers never block the merge writer
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - `foreign_keys = ON`
//!
//! The [`Store`] owns a single connection behind a mutex. Every bundle apply
//! runs while holding it, so writes are serialized across all scopes.

pub mod migrations;
pub mod query;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::ErrorCode;

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema reconciles performed by this process. Not persisted: the first
/// reconcile after start always runs the migrations.
static SCHEMA_RECONCILES: AtomicU64 = AtomicU64::new(0);

/// Errors raised while opening or reconciling the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create store directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open store at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CreateDir { .. } | Self::Open { .. } => ErrorCode::StorageOpenFailed,
            Self::Sqlite(_) => ErrorCode::StorageWriteFailed,
        }
    }
}

/// Durable consumer state.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `path`, apply pragmas and reconcile the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory, connection, pragmas or
    /// migrations fail.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        reconcile_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive access to the connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Bring the schema to [`migrations::LATEST_SCHEMA_VERSION`].
///
/// The first call in a process always migrates. Later calls skip when the
/// store already reports the latest version. Returns `true` if migrations
/// ran.
///
/// # Errors
///
/// Returns an error if reading the version or migrating fails.
pub fn reconcile_schema(conn: &mut Connection) -> rusqlite::Result<bool> {
    let previous = SCHEMA_RECONCILES.fetch_add(1, Ordering::SeqCst);
    if previous > 0
        && migrations::current_schema_version(conn)? == migrations::LATEST_SCHEMA_VERSION
    {
        return Ok(false);
    }
    let version = migrations::migrate(conn)?;
    conn.execute(
        "UPDATE store_meta SET last_reconcile_at_us = ?1 WHERE id = 1",
        [now_us()],
    )?;
    tracing::debug!(version, reconciles = previous + 1, "store schema reconciled");
    Ok(true)
}

/// Number of schema reconciles performed by this process.
#[must_use]
pub fn schema_reconcile_count() -> u64 {
    SCHEMA_RECONCILES.load(Ordering::SeqCst)
}

/// Wall clock in microseconds, the unit of every `*_at_us` column.
pub(crate) fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
