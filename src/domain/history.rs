//! Daily trade-history records
//!
//! `RawDayRecord` is the remote wire shape: sparse, one record per traded
//! day. `DenseDayRecord` is the persisted shape: one record per calendar day
//! with the rolling indicators attached. Its JSON layout is consumed as-is by
//! downstream readers, so field names and order are part of the contract.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::errors::MarketDataError;
use super::market::WorkUnit;

/// Calendar day layout used on the wire and in storage
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// One day of remote trade history for one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDayRecord {
    pub date: String,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub order_count: i64,
    pub volume: i64,
}

impl RawDayRecord {
    /// Parse the calendar day of this record
    pub fn day(&self) -> Result<NaiveDate, MarketDataError> {
        parse_day(&self.date)
    }
}

/// One day of the gap-free persisted series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseDayRecord {
    pub date: NaiveDate,
    pub average: f64,
    #[serde(rename = "average5d")]
    pub average_5d: f64,
    #[serde(rename = "average20d")]
    pub average_20d: f64,
    pub highest: f64,
    pub lowest: f64,
    #[serde(rename = "orderCount")]
    pub order_count: i64,
    pub volume: i64,
    #[serde(rename = "donchianTop")]
    pub donchian_top: f64,
    #[serde(rename = "donchianBottom")]
    pub donchian_bottom: f64,
}

impl DenseDayRecord {
    /// Copy of a traded day; indicators are filled in afterwards
    pub fn traded(date: NaiveDate, raw: &RawDayRecord) -> Self {
        Self {
            date,
            average: raw.average,
            average_5d: 0.0,
            average_20d: 0.0,
            highest: raw.highest,
            lowest: raw.lowest,
            order_count: raw.order_count,
            volume: raw.volume,
            donchian_top: 0.0,
            donchian_bottom: 0.0,
        }
    }

    /// Synthesized day without trades: flat at the previous average
    pub fn flat(date: NaiveDate, previous: &RawDayRecord) -> Self {
        Self {
            date,
            average: previous.average,
            average_5d: 0.0,
            average_20d: 0.0,
            highest: previous.average,
            lowest: previous.average,
            order_count: previous.order_count,
            volume: 0,
            donchian_top: 0.0,
            donchian_bottom: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.volume == 0 && self.highest == self.average && self.lowest == self.average
    }
}

impl From<&DenseDayRecord> for RawDayRecord {
    fn from(day: &DenseDayRecord) -> Self {
        Self {
            date: day.date.format(DATE_FORMAT).to_string(),
            average: day.average,
            highest: day.highest,
            lowest: day.lowest,
            order_count: day.order_count,
            volume: day.volume,
        }
    }
}

/// Dense history of one region, projected back to raw records for merging
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSeries {
    pub region_id: i64,
    pub days: Vec<RawDayRecord>,
}

impl RegionSeries {
    pub fn from_dense(region_id: i64, days: &[DenseDayRecord]) -> Self {
        Self {
            region_id,
            days: days.iter().map(RawDayRecord::from).collect(),
        }
    }
}

/// Serialized history row as stored per (type, region)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredHistory {
    pub type_id: i64,
    pub region_id: i64,
    pub history_json: String,
}

impl StoredHistory {
    pub fn from_days(unit: WorkUnit, days: &[DenseDayRecord]) -> serde_json::Result<Self> {
        Ok(Self {
            type_id: unit.type_id,
            region_id: unit.region_id,
            history_json: serde_json::to_string(days)?,
        })
    }

    /// Placeholder row for a unit the remote API has no history for
    pub fn empty(unit: WorkUnit) -> Self {
        Self {
            type_id: unit.type_id,
            region_id: unit.region_id,
            history_json: "[]".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.history_json.trim() == "[]"
    }

    pub fn days(&self) -> serde_json::Result<Vec<DenseDayRecord>> {
        serde_json::from_str(&self.history_json)
    }
}

pub fn parse_day(text: &str) -> Result<NaiveDate, MarketDataError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| MarketDataError::invalid(format!("invalid date {text:?}: {e}")))
}
