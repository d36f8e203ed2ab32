// Database connection and pool management
// This module handles SQLite database connections using sqlx

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 10).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create database file directory if it doesn't exist
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        info!("🗄️ Database opened: {}", database_url);
        Ok(Self { pool })
    }

    /// Private in-memory database; a single connection keeps it alive
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_history_sql = r"
            CREATE TABLE IF NOT EXISTS History (
                TypeId INTEGER NOT NULL,
                RegionId INTEGER NOT NULL,
                HistoryJson TEXT NOT NULL,
                PRIMARY KEY (TypeId, RegionId)
            )
        ";

        let create_active_market_sql = r"
            CREATE TABLE IF NOT EXISTS ActiveMarket (
                TypeId INTEGER NOT NULL,
                RegionId INTEGER NOT NULL,
                PRIMARY KEY (TypeId, RegionId)
            )
        ";

        let create_order_sql = r"
            CREATE TABLE IF NOT EXISTS MarketOrder (
                OrderId INTEGER PRIMARY KEY,
                RegionId INTEGER NOT NULL,
                Duration INTEGER NOT NULL,
                IsBuyOrder BOOLEAN NOT NULL,
                Issued TEXT NOT NULL,
                LocationId INTEGER NOT NULL,
                MinVolume INTEGER NOT NULL,
                Price REAL NOT NULL,
                Range TEXT NOT NULL,
                SystemId INTEGER NOT NULL,
                TypeId INTEGER NOT NULL,
                VolumeRemain INTEGER NOT NULL,
                VolumeTotal INTEGER NOT NULL
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_order_type_region ON MarketOrder (TypeId, RegionId);
            CREATE INDEX IF NOT EXISTS idx_history_region ON History (RegionId);
        ";

        sqlx::query(create_history_sql).execute(&self.pool).await?;
        sqlx::query(create_active_market_sql).execute(&self.pool).await?;
        sqlx::query(create_order_sql).execute(&self.pool).await?;
        sqlx::query(create_indexes_sql).execute(&self.pool).await?;

        Ok(())
    }
}
