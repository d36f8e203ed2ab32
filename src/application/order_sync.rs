//! Order book download for the configured regions

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history_sync::SyncError;
use crate::domain::{MarketOrder, MarketStore, RawOrder};
use crate::infrastructure::config::OrderConfig;
use crate::infrastructure::esi_client::{EsiClient, EsiRequest};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrderReport {
    pub regions: usize,
    pub orders: u64,
    pub new_markets: u64,
}

pub fn orders_path(region_id: i64, page: u32) -> String {
    format!("/markets/{region_id}/orders?order_type=all&page={page}")
}

#[derive(Clone)]
pub struct OrderSync {
    client: EsiClient,
    store: Arc<dyn MarketStore>,
    config: OrderConfig,
}

impl OrderSync {
    pub fn new(client: EsiClient, store: Arc<dyn MarketStore>, config: OrderConfig) -> Self {
        Self { client, store, config }
    }

    async fn fetch_page(
        &self,
        region_id: i64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<(Vec<MarketOrder>, Option<u32>), SyncError> {
        let request = EsiRequest::get(orders_path(region_id, page))
            .with_priority(self.config.fetch_priority)
            .with_attempts(self.config.fetch_attempts);
        let response = self.client.fetch::<Vec<RawOrder>>(&request, cancel).await?;

        let orders = response
            .data
            .into_iter()
            .map(|raw| MarketOrder::from_raw(raw, region_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((orders, response.pages))
    }

    /// All orders of one region. Page 1 tells how many pages there are; the
    /// rest are shared out to the workers through a page counter. The first
    /// failing page fails the region.
    pub async fn fetch_region(&self, region_id: i64, cancel: &CancellationToken) -> Result<Vec<MarketOrder>, SyncError> {
        let region = cancel.child_token();
        let work = async {
            let (mut orders, pages) = self.fetch_page(region_id, 1, &region).await?;
            let pages = pages.unwrap_or(1);
            debug!("Region {} has {} order pages", region_id, pages);

            let next_page = AtomicU32::new(2);
            let (next_page, region) = (&next_page, &region);
            let workers = (0..self.config.workers.max(1)).map(move |_| async move {
                let mut fetched = Vec::new();
                loop {
                    let page = next_page.fetch_add(1, Ordering::Relaxed);
                    if page > pages {
                        return Ok(fetched);
                    }
                    match self.fetch_page(region_id, page, region).await {
                        Ok((page_orders, _)) => fetched.extend(page_orders),
                        Err(e) => {
                            region.cancel();
                            return Err(e);
                        }
                    }
                }
            });

            let mut first_error = None;
            for outcome in join_all(workers).await {
                match outcome {
                    Ok(page_orders) => orders.extend(page_orders),
                    Err(e) => SyncError::keep_first(&mut first_error, e),
                }
            }
            first_error.map_or(Ok(orders), Err)
        };

        let result = timeout(self.config.region_timeout(), work)
            .await
            .map_err(|_| SyncError::Timeout("region order download"))?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        result
    }

    /// Download every configured region, replace the cached order book and
    /// add newly seen markets to the active work set.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<OrderReport, SyncError> {
        let all = cancel.child_token();
        info!("📦 Downloading orders of {} regions", self.config.regions.len());

        let all = &all;
        let regions = self.config.regions.iter().map(move |&region_id| {
            async move {
                let outcome = self.fetch_region(region_id, all).await;
                match &outcome {
                    Ok(orders) => info!("✅ Region {}: {} orders", region_id, orders.len()),
                    Err(e) => {
                        warn!("❌ Region {} failed: {}", region_id, e);
                        all.cancel();
                    }
                }
                outcome
            }
        });

        let mut orders = Vec::new();
        let mut first_error = None;
        for outcome in join_all(regions).await {
            match outcome {
                Ok(region_orders) => orders.extend(region_orders),
                Err(e) => SyncError::keep_first(&mut first_error, e),
            }
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        let stored = self.store.replace_orders(&orders).await?;
        let new_markets = self.populate().await?;
        Ok(OrderReport {
            regions: self.config.regions.len(),
            orders: stored,
            new_markets,
        })
    }

    /// Add every (type, region) seen in the order book to the active work set
    pub async fn populate(&self) -> Result<u64, SyncError> {
        let added = self.store.populate_active_markets().await?;
        info!("📋 {} new active markets", added);
        Ok(added)
    }
}
