use serde::Serialize;
use std::io::Write;

use crate::core::error::FngError;
use crate::core::record::{IndexRecord, format_date};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Serialize)]
struct ExportRow<'a> {
    date: String,
    value: u8,
    rating: &'a str,
}

/// Writes `records` (already ordered) in the requested format.
pub fn export_records<W: Write>(records: &[IndexRecord], format: ExportFormat, out: &mut W) -> Result<(), FngError> {
    match format {
        ExportFormat::Csv => {
            writeln!(out, "date,value,rating")?;
            for r in records {
                writeln!(out, "{},{},{}", format_date(r.date), r.value, r.rating)?;
            }
        }
        ExportFormat::Json => {
            let rows: Vec<ExportRow> = records
                .iter()
                .map(|r| ExportRow {
                    date: format_date(r.date),
                    value: r.value,
                    rating: r.rating.as_str(),
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &rows)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
