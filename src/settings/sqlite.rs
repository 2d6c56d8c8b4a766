use std::path::Path;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    StoreError,
    settings::SettingsStore,
    store::{SqliteConnection, create_meta, schema_version},
    types::BlockHeight,
};

const SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "settings-version";
const WATERMARK_KEY: &str = "processed-block-height";

/// [`SettingsStore`] persisted in a SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteSettingsStore {
    conn: SqliteConnection,
}

impl SqliteSettingsStore {
    /// Opens (and migrates) the database at `path`. Pass `":memory:"` for a private in-memory
    /// database.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Sqlite`] - if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self { conn: SqliteConnection::open(path, migrate)? })
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    if schema_version(conn, SCHEMA_VERSION_KEY)? < 1 {
        let tx = conn.transaction()?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key VARCHAR(32) PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )",
            [],
        )?;
        create_meta(&tx, SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
        tx.commit()?;
        debug!(version = SCHEMA_VERSION, "Migrated settings schema");
    }
    Ok(())
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn get_confirmed_watermark(&self) -> Result<Option<BlockHeight>, StoreError> {
        self.conn
            .run(|conn| {
                let value: Option<String> = conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        params![WATERMARK_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value.and_then(|v| v.parse().ok()))
            })
            .await
    }

    async fn set_confirmed_watermark(&self, height: BlockHeight) -> Result<(), StoreError> {
        self.conn
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![WATERMARK_KEY, height.to_string()],
                )?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.conn.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IN_MEMORY;

    #[tokio::test]
    async fn empty_store_has_no_watermark() -> anyhow::Result<()> {
        let store = SqliteSettingsStore::open(IN_MEMORY)?;

        assert_eq!(store.get_confirmed_watermark().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn watermark_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.db");

        let store = SqliteSettingsStore::open(&path)?;
        store.set_confirmed_watermark(41).await?;
        store.set_confirmed_watermark(42).await?;
        store.close().await?;
        assert!(matches!(store.get_confirmed_watermark().await, Err(StoreError::Closed)));

        let reopened = SqliteSettingsStore::open(&path)?;
        assert_eq!(reopened.get_confirmed_watermark().await?, Some(42));
        Ok(())
    }
}
