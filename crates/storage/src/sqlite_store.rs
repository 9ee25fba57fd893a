//! Relational embedded backend (SQLite via sqlx)
//!
//! Second in the fallback chain. A single `offline_kv` table holds raw JSON
//! text keyed by the namespaced key; schema setup goes through a versioned
//! `_migrations` table so future columns can be added in place.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use crate::driver::{DriverKind, Result, StoreBackend, StoreConfig, StoreError};

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "create offline_kv",
    "CREATE TABLE IF NOT EXISTS offline_kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
)];

/// SQLite-backed storage driver
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file under the configured data directory
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.data_dir.join("offline.db");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(StoreError::Sqlite)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.sqlite_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let applied: Option<i64> = sqlx::query("SELECT MAX(version) AS v FROM _migrations")
            .fetch_one(&self.pool)
            .await?
            .try_get("v")
            .unwrap_or(None);
        let applied = applied.unwrap_or(0);

        for (version, description, sql) in MIGRATIONS {
            if *version <= applied {
                continue;
            }
            sqlx::query(sql).execute(&self.pool).await?;
            sqlx::query("INSERT INTO _migrations (version, description) VALUES (?1, ?2)")
                .bind(*version)
                .bind(*description)
                .execute(&self.pool)
                .await?;
            tracing::debug!(version = *version, description = *description, "applied storage migration");
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreBackend for SqliteStore {
    fn kind(&self) -> DriverKind {
        DriverKind::Relational
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM offline_kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<String, _>("value")?),
            None => None,
        })
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO offline_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM offline_kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Escape LIKE metacharacters so a literal prefix match is performed.
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let rows = sqlx::query("SELECT key FROM offline_kv WHERE key LIKE ?1 ESCAPE '\\'")
            .bind(format!("{}%", escaped))
            .fetch_all(&self.pool)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get::<String, _>("key")?);
        }
        Ok(keys)
    }
}
