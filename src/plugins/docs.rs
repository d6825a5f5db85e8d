//! README generation from the merged series.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use crate::core::coordinator::Publisher;
use crate::core::error::FngError;
use crate::core::record::{IndexRecord, Rating, format_date};
use crate::core::store::StoreStats;
use crate::core::sync::ChangeDescriptor;

fn badge_color(rating: Option<Rating>) -> &'static str {
    match rating {
        Some(Rating::ExtremeFear) => "red",
        Some(Rating::Fear) => "orange",
        Some(Rating::Neutral) => "yellow",
        Some(Rating::Greed) => "green",
        Some(Rating::ExtremeGreed) => "brightgreen",
        None => "lightgrey",
    }
}

fn badge_text(s: &str) -> String {
    s.replace('-', "--").replace(' ', "_")
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Renders the README. Output depends only on `records`, so regenerating
/// from an unchanged store yields an identical file.
pub fn render_readme(records: &[IndexRecord], trend_days: usize) -> String {
    let stats = StoreStats::from_records(records);
    let latest_date = opt(stats.latest_date.map(format_date));
    let mood = stats.latest_rating.map(|r| r.as_str()).unwrap_or("Unknown");

    let mut out = String::new();
    let _ = writeln!(out, "# Fear & Greed Index Tracker\n");
    let _ = writeln!(
        out,
        "![updated](https://img.shields.io/badge/updated-{}-blue) \
         ![records](https://img.shields.io/badge/records-{}-green) \
         ![sentiment](https://img.shields.io/badge/sentiment-{}-{})\n",
        badge_text(&latest_date),
        stats.total_records,
        badge_text(mood),
        badge_color(stats.latest_rating)
    );
    let _ = writeln!(
        out,
        "Daily history of the CNN Fear & Greed index, synchronized incrementally into a local \
         SQLite store with timestamped snapshots of every change.\n"
    );

    let _ = writeln!(out, "## Current reading\n");
    let _ = writeln!(out, "| Metric | Value |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Latest date | {} |", latest_date);
    let _ = writeln!(out, "| Latest value | {} ({}) |", opt(stats.latest_value), mood);
    let _ = writeln!(out, "| 7-day mean | {:.2} |", stats.avg_7d);
    let _ = writeln!(out, "| 30-day mean | {:.2} |", stats.avg_30d);
    let _ = writeln!(
        out,
        "| Lowest | {} ({}) |",
        opt(stats.min_value),
        opt(stats.min_date.map(format_date))
    );
    let _ = writeln!(
        out,
        "| Highest | {} ({}) |",
        opt(stats.max_value),
        opt(stats.max_date.map(format_date))
    );
    let _ = writeln!(out, "| Records | {} |", stats.total_records);
    let _ = writeln!(
        out,
        "| Coverage | {} to {} |\n",
        opt(stats.earliest_date.map(format_date)),
        latest_date
    );

    let _ = writeln!(out, "## Last {} readings\n", trend_days);
    let _ = writeln!(out, "| Date | Value | Rating |");
    let _ = writeln!(out, "|---|---|---|");
    let start = records.len().saturating_sub(trend_days);
    for r in records[start..].iter().rev() {
        let _ = writeln!(out, "| {} | {} | {} |", format_date(r.date), r.value, r.rating);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Sentiment distribution\n");
    let _ = writeln!(out, "| Rating | Range | Days | Share |");
    let _ = writeln!(out, "|---|---|---|---|");
    for (rating, count) in &stats.distribution {
        let (lo, hi) = rating.bounds();
        let range = if hi > 100 {
            format!("{}-100", lo)
        } else {
            format!("{}-{}", lo, hi - 1)
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} | {:.1}% |",
            rating,
            range,
            count,
            stats.share(*rating)
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Usage\n");
    let _ = writeln!(out, "```bash");
    let _ = writeln!(out, "fng init --csv fear-greed.csv   # import history, then sync");
    let _ = writeln!(out, "fng sync                        # one-shot update");
    let _ = writeln!(out, "fng sync --mode periodic --interval-hours 12");
    let _ = writeln!(out, "fng sync --mode manual          # press Enter to run, q to quit");
    let _ = writeln!(out, "fng status");
    let _ = writeln!(out, "```");
    out
}

/// Regenerates the README after each completed run.
pub struct ReadmePublisher {
    path: PathBuf,
    trend_days: usize,
}

impl ReadmePublisher {
    pub fn new(path: impl Into<PathBuf>, trend_days: usize) -> Self {
        Self {
            path: path.into(),
            trend_days,
        }
    }

    pub fn write(&self, records: &[IndexRecord]) -> Result<PathBuf, FngError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, render_readme(records, self.trend_days))?;
        Ok(self.path.clone())
    }
}

impl Publisher for ReadmePublisher {
    fn name(&self) -> &str {
        "readme"
    }

    fn publish(&self, records: &[IndexRecord], _change: &ChangeDescriptor) -> Result<(), FngError> {
        self.write(records).map(|_| ())
    }
}
