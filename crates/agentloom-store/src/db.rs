//! SQLite connection handle.
//!
//! [`Database`] keeps one `rusqlite::Connection` behind an `Arc<Mutex<_>>`
//! and runs every closure against it on tokio's blocking pool, so async
//! callers never block a runtime worker on file I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Connection pragmas, applied in order on every open.  WAL lets readers
/// proceed while a writer commits; with WAL, `synchronous = NORMAL` only
/// risks the last transaction on power loss.
const PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("temp_store", "MEMORY"),
    ("foreign_keys", "ON"),
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle to a SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Blocks on file I/O; prefer [`Database::open_and_migrate`] from async
    /// code.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening session database");
        Self::configure(Connection::open(path)?)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory session database");
        Self::configure(Connection::open_in_memory()?)
    }

    /// Open the database off the runtime thread and bring its schema up to
    /// date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let db = tokio::task::spawn_blocking(move || Self::open(path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_mut(move |conn| f(conn)).await
    }

    /// Like [`Database::execute`], with a `&mut Connection` for transactions.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = shared
                .lock()
                .map_err(|_| StoreError::TaskJoin("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    fn configure(conn: Connection) -> StoreResult<Self> {
        for &(name, value) in PRAGMAS {
            conn.pragma_update(None, name, value)?;
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(pragmas = PRAGMAS.len(), "session database configured");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}
