//! SQLite-backed persistent store
//!
//! One `kv_store` table in WAL mode. Several worker processes may open the
//! same file; SQLite serializes their writes.

use async_trait::async_trait;
use sdk::errors::StoreError;
use sdk::store::PersistentStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Persistent store over a SQLite database file
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    ///
    /// SQLite replays any leftover WAL from an unclean shutdown when the
    /// file is reopened.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        info!("Opening store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("create store directory: {}", e)))?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)
            .map_err(backend_err)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        debug!("Store connection established");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        debug!("Store migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Physically remove expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    /// Flush the WAL to the main database file
    pub async fn flush_wal(&self) -> Result<(), StoreError> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok(())
    }

    /// Flush the WAL and close every pooled connection
    pub async fn close(&self) -> Result<(), StoreError> {
        self.flush_wal().await?;
        self.pool.close().await;
        info!("Store connection closed");
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let expires_at = ttl.map(|ttl| now.saturating_add(ttl.as_millis() as i64));

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM kv_store WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // substr comparison avoids LIKE wildcard escaping for ':' and '_' heavy keys
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT key FROM kv_store
            WHERE substr(key, 1, length(?)) = ?
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)
    }
}
