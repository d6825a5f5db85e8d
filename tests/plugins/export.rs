use fng_tracker::core::record::{IndexRecord, RawRecord, parse_date};
use fng_tracker::plugins::export::{ExportFormat, export_records};
use fng_tracker::plugins::fetcher::parse_history_csv;

fn records() -> Vec<IndexRecord> {
    [("2024-01-01", 20), ("2024-01-02", 70)]
        .iter()
        .map(|(d, v)| IndexRecord::from_raw(RawRecord::new(parse_date(d).unwrap(), *v)).unwrap())
        .collect()
}

#[test]
fn csv_export_has_header_and_one_row_per_date() {
    let mut out = Vec::new();
    export_records(&records(), ExportFormat::Csv, &mut out).unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "date,value,rating\n2024-01-01,20,Extreme Fear\n2024-01-02,70,Greed\n"
    );
}

#[test]
fn csv_export_reimports_to_the_same_series() {
    let mut out = Vec::new();
    export_records(&records(), ExportFormat::Csv, &mut out).unwrap();
    let import = parse_history_csv(&String::from_utf8(out).unwrap()).unwrap();
    assert_eq!(import.skipped, 0);
    let back: Vec<IndexRecord> = import
        .records
        .into_iter()
        .map(|r| IndexRecord::from_raw(r).unwrap())
        .collect();
    assert_eq!(back, records());
}

#[test]
fn json_export_is_an_array_of_objects() {
    let mut out = Vec::new();
    export_records(&records(), ExportFormat::Json, &mut out).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 2);
    assert_eq!(value[0]["date"], "2024-01-01");
    assert_eq!(value[0]["value"], 20);
    assert_eq!(value[1]["rating"], "Greed");
}
