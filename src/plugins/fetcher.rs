//! Fetcher adapters: the CNN graph-data endpoint, CSV history files, and
//! small wrappers used by one-off runs.

use chrono::{DateTime, NaiveDate};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::SourceConfig;
use crate::core::error::FngError;
use crate::core::record::{RawRecord, format_date, parse_date};
use crate::core::sync::Fetcher;

#[derive(Debug, Deserialize)]
struct GraphData {
    fear_and_greed_historical: Option<Historical>,
}

#[derive(Debug, Deserialize)]
struct Historical {
    #[serde(default)]
    data: Vec<Point>,
}

#[derive(Debug, Deserialize)]
struct Point {
    x: Option<f64>,
    y: Option<f64>,
}

/// Parses the graph-data payload.
///
/// `x` is an epoch-millisecond timestamp mapped to its UTC date; `y` is
/// truncated to an integer. Points missing either field are skipped. Range
/// checks are left to the merge.
pub fn parse_graph_data(body: &str) -> Result<Vec<RawRecord>, FngError> {
    let payload: GraphData = serde_json::from_str(body)
        .map_err(|e| FngError::Fetch(format!("unexpected response shape: {}", e)))?;

    let Some(historical) = payload.fear_and_greed_historical else {
        debug!("response carries no historical series");
        return Ok(Vec::new());
    };

    let mut records = Vec::with_capacity(historical.data.len());
    for point in historical.data {
        let (Some(x), Some(y)) = (point.x, point.y) else {
            continue;
        };
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        let Some(ts) = DateTime::from_timestamp_millis(x as i64) else {
            continue;
        };
        records.push(RawRecord::new(ts.date_naive(), y.trunc() as i64));
    }
    Ok(records)
}

/// Blocking client for the CNN Fear & Greed endpoint.
pub struct CnnFetcher {
    client: reqwest::blocking::Client,
    api_url: String,
    max_retries: u32,
    retry_delay: Duration,
    backfill_start: NaiveDate,
}

impl CnnFetcher {
    pub fn new(config: &SourceConfig) -> Result<Self, FngError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| FngError::Config(format!("invalid user_agent: {}", e)))?;
        headers.insert(USER_AGENT, agent);

        let client = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            backfill_start: config.backfill_start,
        })
    }

    pub fn url_for(&self, start: NaiveDate) -> String {
        format!("{}{}", self.api_url, format_date(start))
    }

    fn get_with_retries(&self, url: &str) -> Result<String, FngError> {
        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            let result = self
                .client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.text());
            match result {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(attempt, max = self.max_retries, error = %e, "request failed");
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        thread::sleep(self.retry_delay * attempt);
                    }
                }
            }
        }
        Err(FngError::Fetch(format!(
            "request to {} failed after {} attempts: {}",
            url,
            self.max_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

impl Fetcher for CnnFetcher {
    fn fetch(&self, since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        let start = since.unwrap_or(self.backfill_start);
        let url = self.url_for(start);
        info!(%url, "fetching index history");
        let body = self.get_with_retries(&url)?;
        let records = parse_graph_data(&body)?;
        debug!(count = records.len(), "parsed candidates");
        Ok(records)
    }
}

/// Serves a fixed batch regardless of the watermark.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    batch: Vec<RawRecord>,
}

impl StaticFetcher {
    pub fn new(batch: Vec<RawRecord>) -> Self {
        Self { batch }
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, _since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        Ok(self.batch.clone())
    }
}

/// Forces a fixed start date, used to refill gaps behind the watermark.
pub struct SinceOverride<F: Fetcher> {
    inner: F,
    since: NaiveDate,
}

impl<F: Fetcher> SinceOverride<F> {
    pub fn new(inner: F, since: NaiveDate) -> Self {
        Self { inner, since }
    }
}

impl<F: Fetcher> Fetcher for SinceOverride<F> {
    fn fetch(&self, _since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        self.inner.fetch(Some(self.since))
    }
}

/// Rows read from a history CSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvImport {
    pub records: Vec<RawRecord>,
    pub skipped: usize,
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"').trim()
}

/// Reads a history CSV with a header row.
///
/// The date column is the one whose name contains `date`; the value column
/// is `value` if present, else the last one mentioning `fear`, `greed` or
/// `value`. Dates are cut to their first ten characters; values are parsed
/// as floats and truncated. Unreadable rows are counted and skipped.
pub fn parse_history_csv(content: &str) -> Result<CsvImport, FngError> {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| FngError::Validation("CSV file is empty".into()))?;
    let columns: Vec<String> = header
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(|c| unquote(c).to_lowercase())
        .collect();

    let date_col = columns
        .iter()
        .position(|c| c.contains("date"))
        .ok_or_else(|| FngError::Validation("CSV has no date column".into()))?;
    let value_col = columns
        .iter()
        .position(|c| c == "value")
        .or_else(|| {
            columns
                .iter()
                .enumerate()
                .filter(|(i, c)| {
                    *i != date_col && (c.contains("fear") || c.contains("greed") || c.contains("value"))
                })
                .map(|(i, _)| i)
                .next_back()
        })
        .ok_or_else(|| FngError::Validation("CSV has no value column".into()))?;

    let mut import = CsvImport::default();
    for line in lines {
        let cells: Vec<&str> = line.split(',').map(unquote).collect();
        let (Some(date_cell), Some(value_cell)) = (cells.get(date_col), cells.get(value_col)) else {
            import.skipped += 1;
            continue;
        };
        let date = date_cell.get(..10).unwrap_or(date_cell);
        let parsed = parse_date(date)
            .ok()
            .zip(value_cell.parse::<f64>().ok().filter(|v| v.is_finite()));
        match parsed {
            Some((date, value)) => import.records.push(RawRecord::new(date, value.trunc() as i64)),
            None => import.skipped += 1,
        }
    }
    Ok(import)
}

pub fn read_history_csv(path: &Path) -> Result<CsvImport, FngError> {
    let content = fs::read_to_string(path)?;
    parse_history_csv(&content)
}
