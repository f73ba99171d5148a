//! SQLite-backed mapping store

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::error::Result;
use crate::model::Mapping;
use crate::repository;
use crate::traits::MappingStore;

/// Pool acquisition bound; a locked or missing database surfaces as
/// `StoreError::Unavailable` instead of stalling a session.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `db_path`
    pub async fn connect(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!("SQLite database connected: {}", db_path.display());
        Ok(Self { pool })
    }

    /// Private in-memory database; one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        repository::init_schema(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn resolve(&self, tcp_address: u16) -> Result<Option<Mapping>> {
        repository::get_mapping(&self.pool, tcp_address).await
    }

    async fn upsert(&self, mapping: Mapping) -> Result<()> {
        repository::upsert_mapping(&self.pool, &mapping).await
    }

    async fn delete(&self, tcp_address: u16) -> Result<bool> {
        repository::delete_mapping(&self.pool, tcp_address).await
    }

    async fn list(&self) -> Result<Vec<Mapping>> {
        repository::list_mappings(&self.pool).await
    }
}
