//! Market identities and regional order rows.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::MarketDataError;

/// Region id reserved for the aggregate series across every region a type
/// trades in. It is computed locally and never fetched.
pub const GLOBAL_REGION_ID: i64 = 0;

const MAX_ORDER_DURATION_DAYS: i64 = 90;
const MAX_ISSUED_LEN: usize = 32;

/// One cacheable market series: an item type in a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    pub type_id: i64,
    pub region_id: i64,
}

impl WorkUnit {
    pub const fn new(type_id: i64, region_id: i64) -> Self {
        Self { type_id, region_id }
    }

    /// Remote path of the daily trade history for this unit
    pub fn history_path(&self) -> String {
        format!("/markets/{}/history?type_id={}", self.region_id, self.type_id)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type {} in region {}", self.type_id, self.region_id)
    }
}

/// Order as served by the remote order-book endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub duration: i64,
    pub is_buy_order: bool,
    pub issued: String,
    pub location_id: i64,
    pub min_volume: i64,
    pub order_id: i64,
    pub price: f64,
    pub range: String,
    pub system_id: i64,
    pub type_id: i64,
    pub volume_remain: i64,
    pub volume_total: i64,
}

/// Order row as cached locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub order_id: i64,
    pub region_id: i64,
    pub duration: i64,
    pub is_buy_order: bool,
    pub issued: String,
    pub location_id: i64,
    pub min_volume: i64,
    pub price: f64,
    pub range: String,
    pub system_id: i64,
    pub type_id: i64,
    pub volume_remain: i64,
    pub volume_total: i64,
}

impl MarketOrder {
    /// Validate a remote order and label it with the region it was listed in
    pub fn from_raw(raw: RawOrder, region_id: i64) -> Result<Self, MarketDataError> {
        if !(0..=MAX_ORDER_DURATION_DAYS).contains(&raw.duration) {
            return Err(MarketDataError::invalid(format!(
                "order {} has invalid duration {}",
                raw.order_id, raw.duration
            )));
        }
        if raw.issued.len() > MAX_ISSUED_LEN || !is_timestamp_text(&raw.issued) {
            return Err(MarketDataError::invalid(format!(
                "order {} has invalid issued time {:?}",
                raw.order_id, raw.issued
            )));
        }
        let range = range_label(&raw.range).ok_or_else(|| {
            MarketDataError::invalid(format!("order {} has invalid range {:?}", raw.order_id, raw.range))
        })?;

        Ok(Self {
            order_id: raw.order_id,
            region_id,
            duration: raw.duration,
            is_buy_order: raw.is_buy_order,
            issued: raw.issued,
            location_id: raw.location_id,
            min_volume: raw.min_volume,
            price: raw.price,
            range: range.to_string(),
            system_id: raw.system_id,
            type_id: raw.type_id,
            volume_remain: raw.volume_remain,
            volume_total: raw.volume_total,
        })
    }
}

/// Display label for a remote order range keyword
pub fn range_label(range: &str) -> Option<&'static str> {
    let label = match range {
        "station" => "Station",
        "region" => "Region",
        "solarsystem" => "Solar System",
        "1" => "1 Jumps",
        "2" => "2 Jumps",
        "3" => "3 Jumps",
        "4" => "4 Jumps",
        "5" => "5 Jumps",
        "10" => "10 Jumps",
        "20" => "20 Jumps",
        "30" => "30 Jumps",
        "40" => "40 Jumps",
        _ => return None,
    };
    Some(label)
}

// Issued timestamps are RFC 3339; anything else is not stored
fn is_timestamp_text(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '.' | '+'))
}
