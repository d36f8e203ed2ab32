//! Domain module - market identities, day records and storage contracts
//!
//! This module contains the plain data types shared by the series engine,
//! the ingestion services and the persistence layer.
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod errors;
pub mod history;
pub mod market;
pub mod repositories;

pub use errors::MarketDataError;
pub use history::{DenseDayRecord, RawDayRecord, RegionSeries, StoredHistory, DATE_FORMAT};
pub use market::{GLOBAL_REGION_ID, MarketOrder, RawOrder, WorkUnit};
pub use repositories::{MarketStore, StoreError};
