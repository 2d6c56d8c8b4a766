use std::{path::Path, time::Duration};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::{
    StoreError,
    delivery::{
        DEFAULT_LOCK_TTL, DeliveryTracker, LockHandle, now_millis, scoped_key, validate_group_id,
    },
    store::{SqliteConnection, create_meta, schema_version},
};

const SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "records-version";

/// [`DeliveryTracker`] persisted in a SQLite database.
///
/// Lease acquisition runs in an `IMMEDIATE` transaction, so several trackers (or processes)
/// sharing one database file never both hold the same key.
#[derive(Clone, Debug)]
pub struct SqliteDeliveryTracker {
    conn: SqliteConnection,
    group: Option<String>,
    lock_ttl: Duration,
}

impl SqliteDeliveryTracker {
    /// Opens (and migrates) the database at `path`. Pass `":memory:"` for a private in-memory
    /// database.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Sqlite`] - if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = SqliteConnection::open(path, migrate)?;
        Ok(Self { conn, group: None, lock_ttl: DEFAULT_LOCK_TTL })
    }

    /// Scopes every key to `group`.
    ///
    /// # Errors
    ///
    /// * [`StoreError::InvalidGroupId`] - if `group` is longer than 16 characters.
    pub fn with_group(mut self, group: impl Into<String>) -> Result<Self, StoreError> {
        let group = group.into();
        validate_group_id(Some(&group))?;
        self.group = Some(group);
        Ok(self)
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.lock_ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let version = schema_version(conn, SCHEMA_VERSION_KEY)?;
    if version < 1 {
        let tx = conn.transaction()?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS records (
                key VARCHAR(128) PRIMARY KEY NOT NULL,
                lock_id VARCHAR(64),
                lock_timestamp INTEGER,
                consumed TEXT NOT NULL
            )",
            [],
        )?;
        create_meta(&tx, SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
        tx.commit()?;
        debug!(version = SCHEMA_VERSION, "Migrated delivery tracker schema");
    }
    Ok(())
}

/// Fails with [`StoreError::LeaseNotHeld`] unless `handle` still owns its record.
fn ensure_held(conn: &Connection, handle: &LockHandle) -> Result<(), StoreError> {
    let holder: Option<Option<String>> = conn
        .query_row("SELECT lock_id FROM records WHERE key = ?1", params![handle.key], |row| {
            row.get(0)
        })
        .optional()?;
    match holder.flatten() {
        Some(id) if id == handle.lock_id.to_string() => Ok(()),
        _ => Err(StoreError::LeaseNotHeld { key: handle.key.clone() }),
    }
}

#[async_trait]
impl DeliveryTracker for SqliteDeliveryTracker {
    async fn acquire_lock(&self, key: &str) -> Result<Option<LockHandle>, StoreError> {
        let key = scoped_key(key, self.group.as_deref());
        let lock_id = Uuid::new_v4();
        let ttl = self.ttl_millis();

        self.conn
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "INSERT OR IGNORE INTO records (key, lock_id, lock_timestamp, consumed)
                     VALUES (?1, NULL, NULL, '0')",
                    params![key],
                )?;

                let now = now_millis();
                tx.execute(
                    "UPDATE records SET lock_id = ?1, lock_timestamp = ?2
                     WHERE key = ?3 AND (lock_id IS NULL OR lock_timestamp < ?4)",
                    params![lock_id.to_string(), now, key, now.saturating_sub(ttl)],
                )?;

                let holder: Option<String> = tx.query_row(
                    "SELECT lock_id FROM records WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                tx.commit()?;

                Ok((holder == Some(lock_id.to_string())).then_some(LockHandle { key, lock_id }))
            })
            .await
    }

    async fn check_consumed(&self, handle: &LockHandle) -> Result<bool, StoreError> {
        let handle = handle.clone();
        self.conn
            .run(move |conn| {
                ensure_held(conn, &handle)?;
                let consumed: String = conn.query_row(
                    "SELECT consumed FROM records WHERE key = ?1",
                    params![handle.key],
                    |row| row.get(0),
                )?;
                Ok(consumed == "1")
            })
            .await
    }

    async fn set_consumed(&self, handle: &LockHandle, consumed: bool) -> Result<(), StoreError> {
        if !consumed {
            // consumed is terminal; only check the lease
            let handle = handle.clone();
            return self.conn.run(move |conn| ensure_held(conn, &handle)).await;
        }

        let handle = handle.clone();
        self.conn
            .run(move |conn| {
                let updated = conn.execute(
                    "UPDATE records SET consumed = '1' WHERE key = ?1 AND lock_id = ?2",
                    params![handle.key, handle.lock_id.to_string()],
                )?;
                if updated == 0 {
                    return Err(StoreError::LeaseNotHeld { key: handle.key });
                }
                Ok(())
            })
            .await
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), StoreError> {
        let handle = handle.clone();
        self.conn
            .run(move |conn| {
                conn.execute(
                    "UPDATE records SET lock_id = NULL, lock_timestamp = NULL
                     WHERE key = ?1 AND lock_id = ?2",
                    params![handle.key, handle.lock_id.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.conn.close()
    }
}
