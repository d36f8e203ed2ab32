//! SQLite implementation of the market store
//!
//! Every operation runs under the configured deadline and fails with
//! `StoreError::Deadline` when it is exceeded.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::{MarketOrder, MarketStore, StoreError, StoredHistory, WorkUnit, GLOBAL_REGION_ID};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    deadline: Duration,
}

impl SqliteStore {
    pub const fn new(pool: SqlitePool, deadline: Duration) -> Self {
        Self { pool, deadline }
    }

    async fn within<T, F>(&self, op: &'static str, work: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        tokio::time::timeout(self.deadline, work)
            .await
            .map_err(|_| StoreError::Deadline { op })?
    }
}

#[async_trait]
impl MarketStore for SqliteStore {
    async fn count_active_markets(&self) -> Result<i64, StoreError> {
        self.within("count_active_markets", async {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ActiveMarket")
                .fetch_one(&self.pool)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn active_market_chunk(&self, offset: i64, limit: i64) -> Result<Vec<WorkUnit>, StoreError> {
        self.within("active_market_chunk", async {
            let rows = sqlx::query(
                r"
                SELECT TypeId, RegionId FROM ActiveMarket
                ORDER BY TypeId, RegionId
                LIMIT ? OFFSET ?
                ",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| WorkUnit::new(row.get("TypeId"), row.get("RegionId")))
                .collect())
        })
        .await
    }

    async fn active_type_ids(&self) -> Result<Vec<i64>, StoreError> {
        self.within("active_type_ids", async {
            let ids = sqlx::query_scalar("SELECT DISTINCT TypeId FROM ActiveMarket ORDER BY TypeId")
                .fetch_all(&self.pool)
                .await?;
            Ok(ids)
        })
        .await
    }

    async fn populate_active_markets(&self) -> Result<u64, StoreError> {
        self.within("populate_active_markets", async {
            let result = sqlx::query(
                r"
                INSERT OR IGNORE INTO ActiveMarket (TypeId, RegionId)
                SELECT DISTINCT TypeId, RegionId FROM MarketOrder
                ",
            )
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn histories_of_type(&self, type_id: i64) -> Result<Vec<StoredHistory>, StoreError> {
        self.within("histories_of_type", async {
            let rows = sqlx::query(
                r"
                SELECT RegionId, HistoryJson FROM History
                WHERE TypeId = ? AND RegionId != ?
                ORDER BY RegionId
                ",
            )
            .bind(type_id)
            .bind(GLOBAL_REGION_ID)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| StoredHistory {
                    type_id,
                    region_id: row.get("RegionId"),
                    history_json: row.get("HistoryJson"),
                })
                .collect())
        })
        .await
    }

    async fn insert_histories(&self, rows: &[StoredHistory]) -> Result<(), StoreError> {
        self.within("insert_histories", async {
            let mut tx = self.pool.begin().await?;
            for row in rows {
                sqlx::query("INSERT OR REPLACE INTO History (TypeId, RegionId, HistoryJson) VALUES (?, ?, ?)")
                    .bind(row.type_id)
                    .bind(row.region_id)
                    .bind(&row.history_json)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn insert_history(&self, row: &StoredHistory) -> Result<(), StoreError> {
        self.within("insert_history", async {
            sqlx::query("INSERT OR REPLACE INTO History (TypeId, RegionId, HistoryJson) VALUES (?, ?, ?)")
                .bind(row.type_id)
                .bind(row.region_id)
                .bind(&row.history_json)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn history(&self, type_id: i64, region_id: i64) -> Result<Option<StoredHistory>, StoreError> {
        self.within("history", async {
            let json: Option<String> =
                sqlx::query_scalar("SELECT HistoryJson FROM History WHERE TypeId = ? AND RegionId = ?")
                    .bind(type_id)
                    .bind(region_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(json.map(|history_json| StoredHistory {
                type_id,
                region_id,
                history_json,
            }))
        })
        .await
    }

    async fn replace_orders(&self, orders: &[MarketOrder]) -> Result<u64, StoreError> {
        self.within("replace_orders", async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM MarketOrder").execute(&mut *tx).await?;

            let mut inserted = 0;
            for order in orders {
                let result = sqlx::query(
                    r"
                    INSERT OR REPLACE INTO MarketOrder
                    (OrderId, RegionId, Duration, IsBuyOrder, Issued, LocationId, MinVolume,
                     Price, Range, SystemId, TypeId, VolumeRemain, VolumeTotal)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ",
                )
                .bind(order.order_id)
                .bind(order.region_id)
                .bind(order.duration)
                .bind(order.is_buy_order)
                .bind(&order.issued)
                .bind(order.location_id)
                .bind(order.min_volume)
                .bind(order.price)
                .bind(&order.range)
                .bind(order.system_id)
                .bind(order.type_id)
                .bind(order.volume_remain)
                .bind(order.volume_total)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }

            tx.commit().await?;
            Ok(inserted)
        })
        .await
    }
}
