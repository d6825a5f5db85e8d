//! Missing-date analysis over a trailing window.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::core::error::FngError;
use crate::core::store::SeriesStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapReport {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Saturdays and Sundays; expected, markets are closed.
    pub weekend: Vec<NaiveDate>,
    pub weekday: Vec<NaiveDate>,
}

impl GapReport {
    pub fn total(&self) -> usize {
        self.weekend.len() + self.weekday.len()
    }

    /// Where a refill fetch should start.
    pub fn earliest_weekday_gap(&self) -> Option<NaiveDate> {
        self.weekday.first().copied()
    }
}

/// Dates in `[today - days, today]` with no record.
pub fn analyze_gaps<S: SeriesStore + ?Sized>(store: &S, today: NaiveDate, days: u32) -> Result<GapReport, FngError> {
    let window_start = today - Duration::days(days as i64);
    let present: BTreeSet<NaiveDate> = store
        .scan_range(window_start, today)?
        .into_iter()
        .map(|r| r.date)
        .collect();

    let mut report = GapReport {
        window_start,
        window_end: today,
        weekend: Vec::new(),
        weekday: Vec::new(),
    };
    for day in window_start.iter_days().take_while(|d| *d <= today) {
        if present.contains(&day) {
            continue;
        }
        match day.weekday() {
            Weekday::Sat | Weekday::Sun => report.weekend.push(day),
            _ => report.weekday.push(day),
        }
    }
    Ok(report)
}
