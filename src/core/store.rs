//! Store abstraction for the index series.
//!
//! A store is an ordered map from date to [`IndexRecord`]: at most one record
//! per date, scanned in ascending date order. Only the synchronizer writes to
//! it, and only through [`SeriesStore::apply`], which is all-or-nothing.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::coordinator::RunReport;
use crate::core::error::FngError;
use crate::core::record::{IndexRecord, Rating};

/// Key-ordered durable storage for one date-keyed series.
pub trait SeriesStore: Send {
    /// Latest date present, the incremental-fetch watermark.
    fn latest_date(&self) -> Result<Option<NaiveDate>, FngError>;

    fn earliest_date(&self) -> Result<Option<NaiveDate>, FngError>;

    fn get(&self, date: NaiveDate) -> Result<Option<IndexRecord>, FngError>;

    /// Every record in ascending date order.
    fn scan(&self) -> Result<Vec<IndexRecord>, FngError>;

    /// Records with `from <= date <= to`, ascending.
    fn scan_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<IndexRecord>, FngError>;

    fn len(&self) -> Result<usize, FngError>;

    fn is_empty(&self) -> Result<bool, FngError> {
        Ok(self.len()? == 0)
    }

    /// Upserts every record in one atomic step.
    fn apply(&mut self, records: &[IndexRecord]) -> Result<(), FngError>;

    /// Appends a finished run to the run journal, if the medium keeps one.
    fn record_run(&mut self, _report: &RunReport) -> Result<(), FngError> {
        Ok(())
    }
}

/// In-memory store backed by a `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: BTreeMap<NaiveDate, IndexRecord>,
    runs: Vec<RunReport>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = IndexRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.date, r)).collect(),
            runs: Vec::new(),
        }
    }

    pub fn runs(&self) -> &[RunReport] {
        &self.runs
    }
}

impl SeriesStore for MemoryStore {
    fn latest_date(&self) -> Result<Option<NaiveDate>, FngError> {
        Ok(self.records.keys().next_back().copied())
    }

    fn earliest_date(&self) -> Result<Option<NaiveDate>, FngError> {
        Ok(self.records.keys().next().copied())
    }

    fn get(&self, date: NaiveDate) -> Result<Option<IndexRecord>, FngError> {
        Ok(self.records.get(&date).copied())
    }

    fn scan(&self) -> Result<Vec<IndexRecord>, FngError> {
        Ok(self.records.values().copied().collect())
    }

    fn scan_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<IndexRecord>, FngError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.records.range(from..=to).map(|(_, r)| *r).collect())
    }

    fn len(&self) -> Result<usize, FngError> {
        Ok(self.records.len())
    }

    fn apply(&mut self, records: &[IndexRecord]) -> Result<(), FngError> {
        for r in records {
            self.records.insert(r.date, *r);
        }
        Ok(())
    }

    fn record_run(&mut self, report: &RunReport) -> Result<(), FngError> {
        self.runs.push(report.clone());
        Ok(())
    }
}

/// Summary statistics over an ordered scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub latest_value: Option<u8>,
    pub latest_rating: Option<Rating>,
    pub min_value: Option<u8>,
    pub min_date: Option<NaiveDate>,
    pub max_value: Option<u8>,
    pub max_date: Option<NaiveDate>,
    pub avg_value: f64,
    pub avg_7d: f64,
    pub avg_30d: f64,
    pub distribution: Vec<(Rating, usize)>,
}

impl StoreStats {
    /// `records` must be in ascending date order, as returned by `scan`.
    pub fn from_records(records: &[IndexRecord]) -> StoreStats {
        let mut distribution: Vec<(Rating, usize)> = Rating::ALL.iter().map(|r| (*r, 0)).collect();
        for r in records {
            if let Some(slot) = distribution.iter_mut().find(|(rating, _)| *rating == r.rating) {
                slot.1 += 1;
            }
        }

        let latest = records.last();
        // First occurrence wins on ties.
        let min = records.iter().fold(None::<&IndexRecord>, |acc, r| match acc {
            Some(m) if m.value <= r.value => Some(m),
            _ => Some(r),
        });
        let max = records.iter().fold(None::<&IndexRecord>, |acc, r| match acc {
            Some(m) if m.value >= r.value => Some(m),
            _ => Some(r),
        });

        StoreStats {
            total_records: records.len(),
            earliest_date: records.first().map(|r| r.date),
            latest_date: latest.map(|r| r.date),
            latest_value: latest.map(|r| r.value),
            latest_rating: latest.map(|r| r.rating),
            min_value: min.map(|r| r.value),
            min_date: min.map(|r| r.date),
            max_value: max.map(|r| r.value),
            max_date: max.map(|r| r.date),
            avg_value: trailing_mean(records, records.len()),
            avg_7d: trailing_mean(records, 7),
            avg_30d: trailing_mean(records, 30),
            distribution,
        }
    }

    pub fn share(&self, rating: Rating) -> f64 {
        if self.total_records == 0 {
            return 0.0;
        }
        let count = self
            .distribution
            .iter()
            .find(|(r, _)| *r == rating)
            .map(|(_, c)| *c)
            .unwrap_or(0);
        count as f64 / self.total_records as f64 * 100.0
    }
}

/// Mean of the last `window` values, rounded to two decimals.
pub fn trailing_mean(records: &[IndexRecord], window: usize) -> f64 {
    let start = records.len().saturating_sub(window);
    let tail = &records[start..];
    if tail.is_empty() {
        return 0.0;
    }
    let sum: u64 = tail.iter().map(|r| r.value as u64).sum();
    let mean = sum as f64 / tail.len() as f64;
    (mean * 100.0).round() / 100.0
}
