//! Global series merger
//!
//! Combines the per-region histories of one item type into a single
//! volume-weighted series spanning the union of their date ranges.

use chrono::{Duration, NaiveDate};

use super::normalizer::{normalize_within, validated_dates};
use crate::domain::{DenseDayRecord, MarketDataError, RawDayRecord, RegionSeries, DATE_FORMAT};

/// Merge regional series into one raw series, one record per calendar day.
///
/// Regions are combined in ascending region id order and empty series are
/// ignored, so the result does not depend on the order of `series`. The
/// combined range may span at most `max_span_days`.
pub fn merge_regions(
    series: &[RegionSeries],
    max_span_days: i64,
) -> Result<Vec<RawDayRecord>, MarketDataError> {
    let mut regions: Vec<&RegionSeries> = series.iter().filter(|s| !s.days.is_empty()).collect();
    regions.sort_by_key(|s| s.region_id);
    if regions.is_empty() {
        return Ok(Vec::new());
    }

    let dates = regions
        .iter()
        .map(|s| validated_dates(&s.days))
        .collect::<Result<Vec<_>, _>>()?;
    let (Some(first), Some(last)) = (
        dates.iter().filter_map(|d| d.first()).min().copied(),
        dates.iter().filter_map(|d| d.last()).max().copied(),
    ) else {
        return Ok(Vec::new());
    };
    let span = (last - first).num_days();
    if span > max_span_days {
        return Err(MarketDataError::invalid(format!(
            "regions span {span} days ({first} to {last}), limit is {max_span_days}"
        )));
    }

    let mut merged: Vec<RawDayRecord> = Vec::with_capacity(span as usize + 1);
    let mut cursors = vec![0usize; regions.len()];
    let mut day = first;
    while day <= last {
        let mut aggregate: Option<RawDayRecord> = None;

        for (j, region) in regions.iter().enumerate() {
            let Some(date) = dates[j].get(cursors[j]) else {
                continue;
            };
            if *date > day {
                // region did not trade today, retry the same record tomorrow
                continue;
            }
            if *date < day {
                return Err(MarketDataError::invalid(format!(
                    "region {} has a record dated {date} behind merge day {day}",
                    region.region_id
                )));
            }

            let record = &region.days[cursors[j]];
            cursors[j] += 1;
            match aggregate.as_mut() {
                None => aggregate = Some(record.clone()),
                Some(total) => accumulate(total, record),
            }
        }

        let record = match aggregate {
            Some(record) => record,
            None => flat_day(day, merged.last())?,
        };
        merged.push(record);
        day += Duration::days(1);
    }

    Ok(merged)
}

/// Merge then normalize: the dense global series of an item type
pub fn global_history(
    series: &[RegionSeries],
    max_span_days: i64,
) -> Result<Vec<DenseDayRecord>, MarketDataError> {
    let merged = merge_regions(series, max_span_days)?;
    normalize_within(&merged, max_span_days)
}

fn accumulate(total: &mut RawDayRecord, day: &RawDayRecord) {
    if day.volume > 0 {
        let (total_volume, day_volume) = (total.volume as f64, day.volume as f64);
        total.average = (total.average * total_volume + day.average * day_volume) / (total_volume + day_volume);
        if total.volume == 0 {
            total.lowest = day.lowest;
            total.highest = day.highest;
        } else {
            total.lowest = total.lowest.min(day.lowest);
            total.highest = total.highest.max(day.highest);
        }
    }
    total.order_count += day.order_count;
    total.volume += day.volume;
}

fn flat_day(day: NaiveDate, previous: Option<&RawDayRecord>) -> Result<RawDayRecord, MarketDataError> {
    let previous = previous.ok_or_else(|| {
        MarketDataError::Invariant(format!("no region contributes to the first merge day {day}"))
    })?;
    Ok(RawDayRecord {
        date: day.format(DATE_FORMAT).to_string(),
        average: previous.average,
        highest: previous.average,
        lowest: previous.average,
        order_count: previous.order_count,
        volume: 0,
    })
}
