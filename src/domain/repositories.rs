//! Repository interfaces for the market cache
//!
//! The ingestion services only ever talk to storage through `MarketStore`.
//! Every call is expected to finish within the deadline the implementation
//! was configured with.

use async_trait::async_trait;
use thiserror::Error;

use super::history::StoredHistory;
use super::market::{MarketOrder, WorkUnit};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database operation '{op}' exceeded its deadline")]
    Deadline { op: &'static str },

    #[error("Stored data could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    // Active work set
    async fn count_active_markets(&self) -> Result<i64, StoreError>;
    async fn active_market_chunk(&self, offset: i64, limit: i64) -> Result<Vec<WorkUnit>, StoreError>;
    async fn active_type_ids(&self) -> Result<Vec<i64>, StoreError>;
    /// Rebuild the active work set from the distinct (type, region) pairs of
    /// the cached order book. Returns the number of newly added markets.
    async fn populate_active_markets(&self) -> Result<u64, StoreError>;

    // Histories
    /// Regional histories of one type; the global row is never included
    async fn histories_of_type(&self, type_id: i64) -> Result<Vec<StoredHistory>, StoreError>;
    /// Replace all given rows in a single transaction
    async fn insert_histories(&self, rows: &[StoredHistory]) -> Result<(), StoreError>;
    async fn insert_history(&self, row: &StoredHistory) -> Result<(), StoreError>;
    async fn history(&self, type_id: i64, region_id: i64) -> Result<Option<StoredHistory>, StoreError>;

    // Orders
    /// Swap the whole cached order book for `orders` in one transaction
    async fn replace_orders(&self, orders: &[MarketOrder]) -> Result<u64, StoreError>;
}
