//! Shared plumbing for the SQLite-backed stores.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::{Connection, OptionalExtension, params};

use crate::StoreError;

/// Path that opens a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// How long a statement waits for another connection's write lock on a shared file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite connection driven from async code.
///
/// Every statement runs on the blocking pool. The connection is dropped by [`close`], after which
/// every call fails with [`StoreError::Closed`].
///
/// [`close`]: SqliteConnection::close
#[derive(Clone, Debug)]
pub(crate) struct SqliteConnection {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteConnection {
    /// Opens `path` (or a private in-memory database for `":memory:"`) and applies `migrate`.
    pub(crate) fn open(
        path: impl AsRef<Path>,
        migrate: impl FnOnce(&mut Connection) -> Result<(), StoreError>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut conn = if path == Path::new(IN_MEMORY) {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&mut conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(Some(conn))) })
    }

    pub(crate) async fn run<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            operation(conn)
        })
        .await?
    }

    pub(crate) fn close(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        }
        Ok(())
    }
}

/// Reads the schema version recorded under `key` in the `meta` table, or 0 if there is none.
///
/// Each store keeps its own key so several stores can share one database file.
pub(crate) fn schema_version(conn: &Connection, key: &str) -> Result<u32, StoreError> {
    let has_meta: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_meta.is_none() {
        return Ok(0);
    }

    let version: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Creates the `meta` table if needed and records `version` under `key`.
pub(crate) fn create_meta(conn: &Connection, key: &str, version: u32) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key VARCHAR(32) PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, version.to_string()],
    )?;
    Ok(())
}
