//! Series normalizer
//!
//! Turns the sparse per-region history served by the remote API into a dense
//! series with one record per calendar day and computes the rolling
//! indicators on top of it.
//!
//! Indicators are updated incrementally:
//! - `average_5d` / `average_20d` use the `(n*prev - leaving + entering) / n`
//!   recurrence with n = 6 and n = 21.
//! - The Donchian channel tracks max/min of the last six days and only
//!   rescans the window when the value leaving it defined the extreme.

use chrono::{Duration, NaiveDate};

use crate::domain::{DenseDayRecord, MarketDataError, RawDayRecord};

/// Largest accepted distance between the first and the last raw day
pub const MAX_SPAN_DAYS: i64 = 1000;

const AVG5_WINDOW: usize = 6;
const AVG20_WINDOW: usize = 21;
const DONCHIAN_LOOKBACK: usize = 6;

/// Normalize one region's history with the default span limit
pub fn normalize(raw: &[RawDayRecord]) -> Result<Vec<DenseDayRecord>, MarketDataError> {
    normalize_within(raw, MAX_SPAN_DAYS)
}

/// Gap-fill `raw` into a dense daily series and compute its indicators.
///
/// `raw` must be sorted by strictly increasing date. An empty input yields an
/// empty series.
pub fn normalize_within(
    raw: &[RawDayRecord],
    max_span_days: i64,
) -> Result<Vec<DenseDayRecord>, MarketDataError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let dates = validated_dates(raw)?;
    let first = dates[0];
    let last = dates[dates.len() - 1];
    let span = (last - first).num_days();
    if span > max_span_days {
        return Err(MarketDataError::invalid(format!(
            "history spans {span} days ({first} to {last}), limit is {max_span_days}"
        )));
    }

    let mut days = Vec::with_capacity(span as usize + 1);
    let mut cursor = 0;
    let mut day = first;
    while day <= last {
        if dates[cursor] == day {
            days.push(DenseDayRecord::traded(day, &raw[cursor]));
            cursor += 1;
        } else {
            // cursor > 0 here: the first day always matches
            days.push(DenseDayRecord::flat(day, &raw[cursor - 1]));
        }
        day += Duration::days(1);
    }

    compute_indicators(&mut days);
    Ok(days)
}

/// Recompute the rolling averages and Donchian channel of a dense series in
/// place. Day 0 is seeded from its own values.
pub fn compute_indicators(days: &mut [DenseDayRecord]) {
    let Some(first) = days.first_mut() else {
        return;
    };
    first.average_5d = first.average;
    first.average_20d = first.average;
    first.donchian_top = first.highest;
    first.donchian_bottom = first.lowest;

    for i in 1..days.len() {
        let prev = &days[i - 1];
        let (prev_avg5, prev_avg20) = (prev.average_5d, prev.average_20d);
        let (prev_top, prev_bottom) = (prev.donchian_top, prev.donchian_bottom);

        let average = days[i].average;
        let average_5d = rolling_average(prev_avg5, days[i.saturating_sub(AVG5_WINDOW)].average, average, AVG5_WINDOW);
        let average_20d =
            rolling_average(prev_avg20, days[i.saturating_sub(AVG20_WINDOW)].average, average, AVG20_WINDOW);

        let leaving = &days[i.saturating_sub(DONCHIAN_LOOKBACK)];
        let window = &days[i.saturating_sub(DONCHIAN_LOOKBACK - 1)..=i];
        let donchian_top = if prev_top == leaving.highest {
            window.iter().map(|d| d.highest).fold(f64::NEG_INFINITY, f64::max)
        } else {
            prev_top.max(days[i].highest)
        };
        let donchian_bottom = if prev_bottom == leaving.lowest {
            window.iter().map(|d| d.lowest).fold(f64::INFINITY, f64::min)
        } else {
            prev_bottom.min(days[i].lowest)
        };

        let today = &mut days[i];
        today.average_5d = average_5d;
        today.average_20d = average_20d;
        today.donchian_top = donchian_top;
        today.donchian_bottom = donchian_bottom;
    }
}

fn rolling_average(previous: f64, leaving: f64, entering: f64, window: usize) -> f64 {
    let n = window as f64;
    (n * previous - leaving + entering) / n
}

pub(crate) fn validated_dates(raw: &[RawDayRecord]) -> Result<Vec<NaiveDate>, MarketDataError> {
    let mut dates: Vec<NaiveDate> = Vec::with_capacity(raw.len());
    for record in raw {
        let date = record.day()?;
        if let Some(previous) = dates.last() {
            if date <= *previous {
                return Err(MarketDataError::invalid(format!(
                    "history is not strictly increasing: {date} follows {previous}"
                )));
            }
        }
        if record.volume < 0 || record.order_count < 0 {
            return Err(MarketDataError::invalid(format!(
                "negative volume or order count on {date}"
            )));
        }
        dates.push(date);
    }
    Ok(dates)
}
