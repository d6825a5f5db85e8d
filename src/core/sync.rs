//! Incremental synchronization of fetched candidates into a [`SeriesStore`].
//!
//! A run reads the watermark, asks the fetcher for candidates from that date
//! on, and merges them:
//!
//! - out-of-range values are dropped and counted as rejected;
//! - unseen dates are inserted;
//! - known dates with a different value are corrected in place;
//! - known dates with the same value are left alone.
//!
//! Duplicate dates inside one batch resolve to the last valid candidate.
//! The resulting upserts are applied in one atomic step.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::FngError;
use crate::core::record::{IndexRecord, RawRecord, RecordRejection, format_date};
use crate::core::store::SeriesStore;

/// Source of candidate records.
///
/// `since = None` asks for a full backfill; otherwise candidates dated on or
/// after `since`. An empty result is not an error.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError>;
}

impl<T: Fetcher + ?Sized> Fetcher for Box<T> {
    fn fetch(&self, since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        (**self).fetch(since)
    }
}

impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    fn fetch(&self, since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        (**self).fetch(since)
    }
}

/// What one merge did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    pub inserted: usize,
    pub corrected: usize,
    pub rejected: usize,
    pub latest_date: Option<NaiveDate>,
    pub total_records: usize,
}

impl ChangeDescriptor {
    /// Only inserts and corrections count; rejections alone are not a change.
    pub fn has_changes(&self) -> bool {
        self.inserted + self.corrected > 0
    }

    /// One-line description used as the snapshot summary and commit message.
    pub fn summary(&self) -> String {
        let latest = self
            .latest_date
            .map(format_date)
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "Update Fear & Greed data: {} new, {} corrected (latest {}, {} records)",
            self.inserted, self.corrected, latest, self.total_records
        );
        if self.rejected > 0 {
            line.push_str(&format!(", {} rejected", self.rejected));
        }
        line
    }
}

/// Upserts a merge would perform, computed without touching the store.
#[derive(Debug, Clone, Default)]
pub struct MergePlan {
    pub upserts: Vec<IndexRecord>,
    pub inserted: usize,
    pub corrected: usize,
    pub unchanged: usize,
    pub rejections: Vec<RecordRejection>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeOutcome {
    pub change: ChangeDescriptor,
    pub rejections: Vec<RecordRejection>,
}

/// Result of one fetch-and-merge pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub since: Option<NaiveDate>,
    pub fetched: usize,
    pub change: ChangeDescriptor,
    pub rejections: Vec<RecordRejection>,
}

pub fn watermark<S: SeriesStore + ?Sized>(store: &S) -> Result<Option<NaiveDate>, FngError> {
    store.latest_date()
}

/// Classifies a batch against the current store contents.
pub fn plan_merge<S, I>(store: &S, batch: I) -> Result<MergePlan, FngError>
where
    S: SeriesStore + ?Sized,
    I: IntoIterator<Item = RawRecord>,
{
    let mut plan = MergePlan::default();
    let mut candidates: BTreeMap<NaiveDate, IndexRecord> = BTreeMap::new();

    for raw in batch {
        match IndexRecord::from_raw(raw) {
            Ok(record) => {
                candidates.insert(record.date, record);
            }
            Err(rejection) => {
                debug!(date = %rejection.date, value = rejection.value, "rejected candidate");
                plan.rejections.push(rejection);
            }
        }
    }

    let (Some(first), Some(last)) = (
        candidates.keys().next().copied(),
        candidates.keys().next_back().copied(),
    ) else {
        return Ok(plan);
    };

    let existing: BTreeMap<NaiveDate, IndexRecord> = store
        .scan_range(first, last)?
        .into_iter()
        .map(|r| (r.date, r))
        .collect();

    for (date, candidate) in candidates {
        match existing.get(&date) {
            None => {
                plan.inserted += 1;
                plan.upserts.push(candidate);
            }
            Some(current) if current.value != candidate.value => {
                debug!(date = %date, from = current.value, to = candidate.value, "correcting value");
                plan.corrected += 1;
                plan.upserts.push(candidate);
            }
            Some(_) => plan.unchanged += 1,
        }
    }

    Ok(plan)
}

/// Merges a batch into the store and reports the resulting change.
pub fn merge<S, I>(store: &mut S, batch: I) -> Result<MergeOutcome, FngError>
where
    S: SeriesStore + ?Sized,
    I: IntoIterator<Item = RawRecord>,
{
    let plan = plan_merge(&*store, batch)?;
    apply_plan(store, plan)
}

fn apply_plan<S: SeriesStore + ?Sized>(store: &mut S, plan: MergePlan) -> Result<MergeOutcome, FngError> {
    store.apply(&plan.upserts)?;

    let change = ChangeDescriptor {
        inserted: plan.inserted,
        corrected: plan.corrected,
        rejected: plan.rejections.len(),
        latest_date: store.latest_date()?,
        total_records: store.len()?,
    };
    Ok(MergeOutcome {
        change,
        rejections: plan.rejections,
    })
}

/// A fetched and classified batch that has not touched the store yet.
#[derive(Debug, Clone)]
pub struct PendingSync {
    pub since: Option<NaiveDate>,
    pub fetched: usize,
    pub plan: MergePlan,
}

impl PendingSync {
    /// The series as it will read once committed, and the change that amounts to.
    pub fn preview<S: SeriesStore + ?Sized>(
        &self,
        store: &S,
    ) -> Result<(Vec<IndexRecord>, ChangeDescriptor), FngError> {
        let mut series: BTreeMap<NaiveDate, IndexRecord> =
            store.scan()?.into_iter().map(|r| (r.date, r)).collect();
        for record in &self.plan.upserts {
            series.insert(record.date, *record);
        }
        let records: Vec<IndexRecord> = series.into_values().collect();
        let change = ChangeDescriptor {
            inserted: self.plan.inserted,
            corrected: self.plan.corrected,
            rejected: self.plan.rejections.len(),
            latest_date: records.last().map(|r| r.date),
            total_records: records.len(),
        };
        Ok((records, change))
    }
}

/// Reads the watermark, fetches from it, and classifies the batch.
pub fn prepare<S, F>(store: &S, fetcher: &F) -> Result<PendingSync, FngError>
where
    S: SeriesStore + ?Sized,
    F: Fetcher + ?Sized,
{
    let since = watermark(store)?;
    match since {
        Some(d) => info!(since = %d, "incremental fetch"),
        None => info!("store empty; requesting full backfill"),
    }

    let batch = fetcher.fetch(since)?;
    let fetched = batch.len();
    let plan = plan_merge(store, batch)?;
    Ok(PendingSync { since, fetched, plan })
}

/// Applies a prepared batch in one atomic step.
pub fn commit<S: SeriesStore + ?Sized>(store: &mut S, pending: PendingSync) -> Result<SyncReport, FngError> {
    let PendingSync { since, fetched, plan } = pending;
    let outcome = apply_plan(store, plan)?;

    if !outcome.rejections.is_empty() {
        warn!(rejected = outcome.rejections.len(), "dropped out-of-range candidates");
    }
    info!(
        fetched,
        inserted = outcome.change.inserted,
        corrected = outcome.change.corrected,
        total = outcome.change.total_records,
        "merge complete"
    );

    Ok(SyncReport {
        since,
        fetched,
        change: outcome.change,
        rejections: outcome.rejections,
    })
}

/// Fetches from the watermark on and merges the result.
pub fn synchronize<S, F>(store: &mut S, fetcher: &F) -> Result<SyncReport, FngError>
where
    S: SeriesStore + ?Sized,
    F: Fetcher + ?Sized,
{
    let pending = prepare(&*store, fetcher)?;
    commit(store, pending)
}
