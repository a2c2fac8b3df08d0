//! Local SQLite persistence for offline-first operations
//!
//! Provides a durable [`StateStore`] so pending changes, pending conflicts
//! and the audit trail survive an app restart.

use crate::error::SyncResult;
use crate::state_store::StateStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

/// Configuration for local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDbConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to enable secure deletion (overwrites freed pages)
    /// so cleared health records do not linger on disk
    pub enable_secure_delete: bool,
}

impl Default for LocalDbConfig {
    fn default() -> Self {
        Self {
            db_path: "medsync_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

/// SQLite-backed key/value store
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `config.db_path`
    pub async fn new(config: LocalDbConfig) -> SyncResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true);

        // Pragmas go on the connect options so every pooled connection gets them
        if config.enable_wal {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        if config.enable_secure_delete {
            options = options.pragma("secure_delete", "ON");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local sync database");

        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reclaim space and scrub freed pages after bulk removals
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM sync_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        let size = value.len();

        sqlx::query(
            r#"
            INSERT INTO sync_kv (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(key, size, "Persisted sync state section");

        Ok(())
    }

    async fn remove(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
