//! History download and global history computation
//!
//! `fetch_batch` fans a chunk of work units out to a fixed pool of workers
//! fed by a bounded queue. The first fatal error cancels the whole batch;
//! a batch is retried as a unit by `download`.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::merger::global_history;
use super::normalizer::normalize_within;
use crate::domain::{
    DenseDayRecord, MarketDataError, MarketStore, RawDayRecord, RegionSeries, StoreError, StoredHistory, WorkUnit,
    GLOBAL_REGION_ID,
};
use crate::infrastructure::config::HistoryConfig;
use crate::infrastructure::esi_client::{EsiClient, EsiRequest};
use crate::infrastructure::esi_error::FetchError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(FetchError),

    #[error(transparent)]
    Data(#[from] MarketDataError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("{0} exceeded its deadline")]
    Timeout(&'static str),

    #[error("Batch failed {attempts} times: {source}")]
    BatchExhausted {
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },
}

impl From<FetchError> for SyncError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::Cancelled => Self::Cancelled,
            other => Self::Fetch(other),
        }
    }
}

impl SyncError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A semantic rejection by the remote API; retrying cannot help
    pub const fn is_remote_rejection(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Remote { .. }))
    }

    /// Keep the first real failure; cancellations caused by it come later
    pub(crate) fn keep_first(slot: &mut Option<Self>, error: Self) {
        match slot {
            Some(existing) if !existing.is_cancelled() => {}
            _ => *slot = Some(error),
        }
    }
}

/// Dense history of one work unit; empty when the remote has none
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedHistory {
    pub unit: WorkUnit,
    pub days: Vec<DenseDayRecord>,
}

impl FetchedHistory {
    pub fn to_stored(&self) -> Result<StoredHistory, serde_json::Error> {
        if self.days.is_empty() {
            return Ok(StoredHistory::empty(self.unit));
        }
        StoredHistory::from_days(self.unit, &self.days)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    pub chunks: usize,
    pub stored: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GlobalReport {
    pub merged: usize,
    pub relabelled: usize,
    pub without_history: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalOutcome {
    NoHistory,
    Relabelled,
    Merged { regions: usize },
}

// Everything a worker needs, cheap to clone into a task
#[derive(Clone)]
struct UnitFetcher {
    client: EsiClient,
    priority: i64,
    attempts: u32,
    max_span_days: i64,
}

impl UnitFetcher {
    /// `Ok(None)` when the unit's data is unusable and the unit is skipped
    async fn fetch(&self, unit: WorkUnit, cancel: &CancellationToken) -> Result<Option<FetchedHistory>, SyncError> {
        let request = EsiRequest::get(unit.history_path())
            .with_priority(self.priority)
            .with_attempts(self.attempts);

        let raw: Vec<RawDayRecord> = match self.client.fetch(&request, cancel).await {
            Ok(response) => response.data,
            Err(e) if matches!(e.remote_code(), Some(400 | 404)) => {
                debug!("No history for {}: {}", unit, e);
                return Ok(Some(FetchedHistory { unit, days: Vec::new() }));
            }
            Err(e) => return Err(e.into()),
        };

        match normalize_within(&raw, self.max_span_days) {
            Ok(days) => Ok(Some(FetchedHistory { unit, days })),
            Err(MarketDataError::InvalidRemoteData(reason)) => {
                warn!("⚠️  Skipping {}: {}", unit, reason);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone)]
pub struct HistorySync {
    fetcher: UnitFetcher,
    store: Arc<dyn MarketStore>,
    config: HistoryConfig,
}

impl HistorySync {
    pub fn new(client: EsiClient, store: Arc<dyn MarketStore>, config: HistoryConfig) -> Self {
        Self {
            fetcher: UnitFetcher {
                client,
                priority: config.fetch_priority,
                attempts: config.fetch_attempts,
                max_span_days: config.max_span_days,
            },
            store,
            config,
        }
    }

    /// Fetch and normalize the histories of `units`.
    ///
    /// Units with unusable data are left out of the result. Any other error
    /// cancels the remaining work and is returned; the first one wins.
    pub async fn fetch_batch(
        &self,
        units: &[WorkUnit],
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedHistory>, SyncError> {
        let batch = cancel.child_token();
        let deadline = Instant::now() + self.config.batch_timeout();
        let capacity = self.config.queue_capacity.max(1);

        let (work_tx, work_rx) = mpsc::channel::<WorkUnit>(capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Result<Option<FetchedHistory>, SyncError>>(capacity);

        let mut tasks = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let fetcher = self.fetcher.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let batch = batch.clone();
            tasks.spawn(async move {
                loop {
                    let next = {
                        let mut work_rx = work_rx.lock().await;
                        tokio::select! {
                            unit = work_rx.recv() => unit,
                            () = batch.cancelled() => None,
                        }
                    };
                    let Some(unit) = next else { break };

                    let outcome = fetcher.fetch(unit, &batch).await;
                    let failed = outcome.is_err();
                    if failed {
                        batch.cancel();
                    }
                    if result_tx.send(outcome).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        {
            let units = units.to_vec();
            let batch = batch.clone();
            tasks.spawn(async move {
                for unit in units {
                    tokio::select! {
                        sent = work_tx.send(unit) => if sent.is_err() { break },
                        () = batch.cancelled() => break,
                    }
                }
            });
        }

        let mut histories = Vec::with_capacity(units.len());
        let mut first_error = None;
        loop {
            tokio::select! {
                received = result_rx.recv() => match received {
                    Some(Ok(Some(history))) => histories.push(history),
                    Some(Ok(None)) => {}
                    Some(Err(e)) => SyncError::keep_first(&mut first_error, e),
                    None => break,
                },
                () = sleep_until(deadline), if !batch.is_cancelled() => {
                    batch.cancel();
                    SyncError::keep_first(&mut first_error, SyncError::Timeout("history batch"));
                }
            }
        }

        // join barrier: no worker outlives the batch
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("History worker ended abnormally: {}", e);
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        histories.sort_by_key(|h| h.unit);
        Ok(histories)
    }

    /// `fetch_batch` with the outer retry budget. Semantic remote errors and
    /// cancellation end it immediately.
    pub async fn fetch_batch_with_retry(
        &self,
        units: &[WorkUnit],
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedHistory>, SyncError> {
        let attempts = self.config.batch_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.fetch_batch(units, cancel).await {
                Ok(histories) => return Ok(histories),
                Err(e) if e.is_cancelled() || e.is_remote_rejection() => return Err(e),
                Err(e) => {
                    warn!("🔄 History chunk failed (attempt {}/{}): {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    () = sleep(self.config.batch_retry_delay()) => {}
                    () = cancel.cancelled() => return Err(SyncError::Cancelled),
                }
            }
        }

        Err(SyncError::BatchExhausted {
            attempts,
            source: Box::new(last_error.unwrap_or(SyncError::Cancelled)),
        })
    }

    /// Refresh the history of every active market, one chunk at a time.
    /// Each chunk is persisted in a single transaction.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<DownloadReport, SyncError> {
        let total = self.store.count_active_markets().await?;
        let chunk_size = self.config.chunk_size.max(1) as i64;
        info!("📥 Downloading histories of {} active markets", total);

        let mut report = DownloadReport::default();
        let mut offset = 0;
        while offset < total {
            let chunk = self.store.active_market_chunk(offset, chunk_size).await?;
            if chunk.is_empty() {
                break;
            }

            let histories = self.fetch_batch_with_retry(&chunk, cancel).await?;
            let rows = histories
                .iter()
                .map(FetchedHistory::to_stored)
                .collect::<Result<Vec<_>, _>>()?;
            self.store.insert_histories(&rows).await?;

            report.chunks += 1;
            report.stored += rows.len();
            report.skipped += chunk.len() - rows.len();
            debug!("Stored history chunk at offset {} ({} rows)", offset, rows.len());
            offset += chunk_size;
        }

        info!(
            "✅ History download finished: {} stored, {} skipped in {} chunks",
            report.stored, report.skipped, report.chunks
        );
        Ok(report)
    }

    /// Rebuild the global (region 0) history of every active type.
    ///
    /// Failures of a single type are logged and skipped; broken invariants
    /// and cancellation stop the pass.
    pub async fn compute_global_histories(&self, cancel: &CancellationToken) -> Result<GlobalReport, SyncError> {
        let type_ids = self.store.active_type_ids().await?;
        info!("🌐 Computing global histories of {} types", type_ids.len());

        let mut report = GlobalReport::default();
        for type_id in type_ids {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match self.compute_global_history_of_type(type_id).await {
                Ok(GlobalOutcome::NoHistory) => report.without_history += 1,
                Ok(GlobalOutcome::Relabelled) => report.relabelled += 1,
                Ok(GlobalOutcome::Merged { .. }) => report.merged += 1,
                Err(SyncError::Data(e)) if e.is_invariant() => return Err(e.into()),
                Err(e) => {
                    warn!("⚠️  Can't compute global history for type {}: {}", type_id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "✅ Global histories: {} merged, {} single region, {} without history, {} failed",
            report.merged, report.relabelled, report.without_history, report.failed
        );
        Ok(report)
    }

    pub async fn compute_global_history_of_type(&self, type_id: i64) -> Result<GlobalOutcome, SyncError> {
        let histories: Vec<StoredHistory> = self
            .store
            .histories_of_type(type_id)
            .await?
            .into_iter()
            .filter(|h| !h.is_empty())
            .collect();

        match histories.as_slice() {
            [] => Ok(GlobalOutcome::NoHistory),
            [single] => {
                let global = StoredHistory {
                    region_id: GLOBAL_REGION_ID,
                    ..single.clone()
                };
                self.store.insert_history(&global).await?;
                Ok(GlobalOutcome::Relabelled)
            }
            many => {
                let series = many
                    .iter()
                    .map(|h| -> Result<RegionSeries, serde_json::Error> {
                        Ok(RegionSeries::from_dense(h.region_id, &h.days()?))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let days = global_history(&series, self.config.max_span_days)?;
                let global = StoredHistory::from_days(WorkUnit::new(type_id, GLOBAL_REGION_ID), &days)?;
                self.store.insert_history(&global).await?;
                Ok(GlobalOutcome::Merged { regions: many.len() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_real_error_wins_over_cancellations() {
        let mut slot = None;
        SyncError::keep_first(&mut slot, SyncError::Cancelled);
        SyncError::keep_first(&mut slot, SyncError::Timeout("history batch"));
        SyncError::keep_first(&mut slot, SyncError::Data(MarketDataError::invalid("late")));
        assert!(matches!(slot, Some(SyncError::Timeout(_))));
    }

    #[test]
    fn fetch_cancellation_maps_to_sync_cancellation() {
        assert!(SyncError::from(FetchError::Cancelled).is_cancelled());
        let rejected = SyncError::from(FetchError::Remote {
            code: 403,
            message: "forbidden".into(),
        });
        assert!(rejected.is_remote_rejection());
        assert!(!rejected.is_cancelled());
    }

    #[test]
    fn empty_fetched_history_is_stored_as_empty_array() {
        let fetched = FetchedHistory {
            unit: WorkUnit::new(34, 10000002),
            days: Vec::new(),
        };
        assert!(fetched.to_stored().unwrap().is_empty());
    }
}
