use fng_tracker::core::coordinator::Publisher;
use fng_tracker::core::record::{IndexRecord, RawRecord, parse_date};
use fng_tracker::core::sync::ChangeDescriptor;
use fng_tracker::plugins::docs::{ReadmePublisher, render_readme};
use std::fs;
use tempfile::tempdir;

fn series(points: &[(&str, i64)]) -> Vec<IndexRecord> {
    points
        .iter()
        .map(|(d, v)| IndexRecord::from_raw(RawRecord::new(parse_date(d).unwrap(), *v)).unwrap())
        .collect()
}

#[test]
fn readme_reports_latest_reading_and_trend_newest_first() {
    let records = series(&[
        ("2024-01-01", 20),
        ("2024-01-02", 50),
        ("2024-01-03", 80),
        ("2024-01-04", 60),
    ]);
    let readme = render_readme(&records, 3);

    assert!(readme.starts_with("# Fear & Greed Index Tracker"));
    assert!(readme.contains("| Latest value | 60 (Greed) |"));
    assert!(readme.contains("| Lowest | 20 (2024-01-01) |"));
    assert!(readme.contains("| Highest | 80 (2024-01-03) |"));
    assert!(readme.contains("| Coverage | 2024-01-01 to 2024-01-04 |"));
    assert!(readme.contains("sentiment-Greed-green"));

    let newest = readme.find("| 2024-01-04 | 60 | Greed |").unwrap();
    let oldest = readme.find("| 2024-01-02 | 50 | Neutral |").unwrap();
    assert!(newest < oldest);
    assert!(!readme.contains("| 2024-01-01 | 20 |"), "outside the trend window");

    assert!(readme.contains("| Extreme Greed | 75-100 | 1 | 25.0% |"));
    assert!(readme.contains("| Extreme Fear | 0-24 | 1 | 25.0% |"));
}

#[test]
fn readme_is_deterministic_and_handles_an_empty_store() {
    let records = series(&[("2024-02-01", 45)]);
    assert_eq!(render_readme(&records, 30), render_readme(&records, 30));

    let empty = render_readme(&[], 30);
    assert!(empty.contains("| Latest date | - |"));
    assert!(empty.contains("sentiment-Unknown-lightgrey"));
}

#[test]
fn publisher_writes_the_file_and_creates_parents() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("docs").join("README.md");
    let publisher = ReadmePublisher::new(&path, 30);
    let records = series(&[("2024-01-01", 10)]);

    publisher.publish(&records, &ChangeDescriptor::default()).unwrap();
    let written = fs::read_to_string(&path).unwrap();
    assert_eq!(written, render_readme(&records, 30));
    assert_eq!(publisher.name(), "readme");
}
