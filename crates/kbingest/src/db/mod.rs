//! SQLite persistence for ingestion jobs, their items, task runs and
//! user notifications.
//!
//! Every repository module exposes free functions over a shared
//! [`Database`]. Status transitions are written as conditional updates, so
//! two writers racing on the same row cannot both win.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction};

pub mod error;
pub mod item_repo;
pub mod job_repo;
pub mod migrations;
pub mod notification_repo;
pub mod run_repo;

pub use error::DatabaseError;

/// Shared handle to the engine's SQLite connection.
///
/// Clones point at the same connection. Callers never hold the lock across
/// an `.await`; each `with_conn`/`with_tx` closure is synchronous.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file at `path`, creating it and its parent
    /// directory on first use, then brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let db = Self::prepare(Connection::open(path)?, true)?;
        log::info!("Job store ready at {}", path.display());
        Ok(db)
    }

    /// Opens a private in-memory store with the full schema applied.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, false)
    }

    fn prepare(conn: Connection, file_backed: bool) -> Result<Self, DatabaseError> {
        if file_backed {
            // Status queries read while the pipeline writes.
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let guard = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&guard)
    }

    /// Runs `f` inside a transaction. Any error rolls the whole unit back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DatabaseError>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }
}

/// Where the daemon keeps its store when no path is configured:
/// `~/.kbingest/data/kbingest.db`.
pub fn default_database_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    Some(home.join(".kbingest").join("data").join("kbingest.db"))
}
