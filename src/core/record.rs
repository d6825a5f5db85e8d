//! Daily index records and the sentiment rating derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::FngError;

pub const MIN_VALUE: i64 = 0;
pub const MAX_VALUE: i64 = 100;

/// Sentiment label for an index value.
///
/// Thresholds are half-open except the top bucket, which includes 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rating {
    #[serde(rename = "Extreme Fear")]
    ExtremeFear,
    Fear,
    Neutral,
    Greed,
    #[serde(rename = "Extreme Greed")]
    ExtremeGreed,
}

impl Rating {
    pub const ALL: [Rating; 5] = [
        Rating::ExtremeFear,
        Rating::Fear,
        Rating::Neutral,
        Rating::Greed,
        Rating::ExtremeGreed,
    ];

    pub fn from_value(value: u8) -> Rating {
        match value {
            0..=24 => Rating::ExtremeFear,
            25..=44 => Rating::Fear,
            45..=54 => Rating::Neutral,
            55..=74 => Rating::Greed,
            _ => Rating::ExtremeGreed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::ExtremeFear => "Extreme Fear",
            Rating::Fear => "Fear",
            Rating::Neutral => "Neutral",
            Rating::Greed => "Greed",
            Rating::ExtremeGreed => "Extreme Greed",
        }
    }

    /// Inclusive lower bound and exclusive upper bound of the bucket.
    pub fn bounds(&self) -> (u8, u8) {
        match self {
            Rating::ExtremeFear => (0, 25),
            Rating::Fear => (25, 45),
            Rating::Neutral => (45, 55),
            Rating::Greed => (55, 75),
            Rating::ExtremeGreed => (75, 101),
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = FngError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rating::ALL
            .iter()
            .copied()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FngError::Validation(format!("unknown rating label '{}'", s)))
    }
}

/// Candidate record as supplied by a fetcher, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub date: NaiveDate,
    pub value: i64,
}

impl RawRecord {
    pub fn new(date: NaiveDate, value: i64) -> Self {
        Self { date, value }
    }
}

/// A validated record as held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub date: NaiveDate,
    pub value: u8,
    pub rating: Rating,
}

impl IndexRecord {
    /// Validates the range and derives the rating.
    pub fn from_raw(raw: RawRecord) -> Result<IndexRecord, RecordRejection> {
        if !(MIN_VALUE..=MAX_VALUE).contains(&raw.value) {
            return Err(RecordRejection {
                date: raw.date,
                value: raw.value,
                reason: format!("value {} outside [{}, {}]", raw.value, MIN_VALUE, MAX_VALUE),
            });
        }
        let value = raw.value as u8;
        Ok(IndexRecord {
            date: raw.date,
            value,
            rating: Rating::from_value(value),
        })
    }

    /// Rebuilds a record from persisted columns, checking the stored rating
    /// against the one recomputed from the value.
    pub fn from_persisted(date: &str, value: i64, rating: &str) -> Result<IndexRecord, FngError> {
        let date = parse_date(date)?;
        let record = IndexRecord::from_raw(RawRecord { date, value })
            .map_err(|r| FngError::Validation(format!("corrupt row {}: {}", date, r.reason)))?;
        let stored: Rating = rating.parse()?;
        if stored != record.rating {
            return Err(FngError::Validation(format!(
                "corrupt row {}: stored rating '{}' does not match value {} ({})",
                date, stored, record.value, record.rating
            )));
        }
        Ok(record)
    }
}

/// A candidate dropped by validation. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordRejection {
    pub date: NaiveDate,
    pub value: i64,
    pub reason: String,
}

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Result<NaiveDate, FngError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| FngError::Validation(format!("invalid date '{}': {}", s, e)))
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}
