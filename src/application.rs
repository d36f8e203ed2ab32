//! Application layer module
//!
//! This module contains the pure series engine (normalization and merging)
//! and the services that orchestrate fetching and persisting market data.

pub mod history_sync;
pub mod merger;
pub mod normalizer;
pub mod order_sync;

pub use history_sync::{HistorySync, SyncError};
pub use merger::{global_history, merge_regions};
pub use normalizer::{compute_indicators, normalize};
pub use order_sync::OrderSync;
