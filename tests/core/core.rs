use chrono::{NaiveDate, TimeZone, Utc};
use fng_tracker::core::coordinator::{
    Coordinator, CoordinatorHandle, Publisher, RunOutcome, RunState, TriggerDisposition,
    TriggerOutcome, TriggerSource,
};
use fng_tracker::core::db::SqliteStore;
use fng_tracker::core::error::FngError;
use fng_tracker::core::record::{IndexRecord, RawRecord, Rating, parse_date};
use fng_tracker::core::snapshot::{SnapshotManager, VersionControl, VersionOutcome, VersionReceipt};
use fng_tracker::core::store::{MemoryStore, SeriesStore};
use fng_tracker::core::sync::{ChangeDescriptor, Fetcher, merge};
use fng_tracker::core::time::{Clock, ManualClock};
use fng_tracker::plugins::docs::ReadmePublisher;
use fng_tracker::plugins::fetcher::StaticFetcher;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn d(s: &str) -> NaiveDate {
    parse_date(s).unwrap()
}

fn raw(date: &str, value: i64) -> RawRecord {
    RawRecord::new(d(date), value)
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap()))
}

fn snapshots(tmp: &TempDir) -> SnapshotManager {
    SnapshotManager::new(tmp.path().join("backups"), tmp.path().join("fng_data.db"), 10)
}

/// Returns a fixed batch and remembers every `since` it was asked for.
struct RecordingFetcher {
    batch: Vec<RawRecord>,
    calls: Arc<Mutex<Vec<Option<NaiveDate>>>>,
}

impl Fetcher for RecordingFetcher {
    fn fetch(&self, since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        self.calls.lock().unwrap().push(since);
        Ok(self.batch.clone())
    }
}

struct RecordingVc {
    summaries: Arc<Mutex<Vec<String>>>,
}

impl VersionControl for RecordingVc {
    fn name(&self) -> &str {
        "recording"
    }

    fn record(&self, snapshot: &Path, summary: &str) -> Result<VersionReceipt, FngError> {
        assert!(snapshot.exists(), "snapshot must be written before hand-off");
        self.summaries.lock().unwrap().push(summary.to_string());
        Ok(VersionReceipt::Committed { pushed: false })
    }
}

#[test]
fn empty_store_backfill_inserts_and_commits() {
    let tmp = tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let summaries = Arc::new(Mutex::new(Vec::new()));
    let fetcher = RecordingFetcher {
        batch: vec![raw("2024-01-01", 20), raw("2024-01-02", 70)],
        calls: Arc::clone(&calls),
    };
    let c = Coordinator::new(MemoryStore::new(), Box::new(fetcher), snapshots(&tmp), clock())
        .with_version_control(Box::new(RecordingVc {
            summaries: Arc::clone(&summaries),
        }));

    let TriggerOutcome::Ran(report) = c.run_once() else {
        panic!("expected a run");
    };
    let RunOutcome::Completed { sync, snapshot, version } = report.outcome else {
        panic!("run failed");
    };
    assert_eq!(sync.since, None);
    assert_eq!(sync.change.inserted, 2);
    assert_eq!(sync.change.corrected, 0);
    assert_eq!(sync.change.latest_date, Some(d("2024-01-02")));
    assert!(snapshot.is_some());
    assert_eq!(version, VersionOutcome::Recorded {
        receipt: VersionReceipt::Committed { pushed: false }
    });
    assert_eq!(calls.lock().unwrap().as_slice(), &[None]);

    let summaries = summaries.lock().unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].contains("2 new"));

    let records = c.read_store(|s| s.scan().unwrap());
    let ratings: Vec<Rating> = records.iter().map(|r| r.rating).collect();
    assert_eq!(ratings, vec![Rating::ExtremeFear, Rating::Greed]);
}

#[test]
fn nothing_new_since_watermark_skips_snapshot_and_commit() {
    let tmp = tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let summaries = Arc::new(Mutex::new(Vec::new()));
    let store = MemoryStore::with_records([IndexRecord::from_raw(raw("2024-01-01", 20)).unwrap()]);
    let fetcher = RecordingFetcher {
        batch: Vec::new(),
        calls: Arc::clone(&calls),
    };
    let manager = snapshots(&tmp);
    let c = Coordinator::new(store, Box::new(fetcher), snapshots(&tmp), clock()).with_version_control(
        Box::new(RecordingVc {
            summaries: Arc::clone(&summaries),
        }),
    );

    let TriggerOutcome::Ran(report) = c.run_once() else {
        panic!("expected a run");
    };
    let change = report.change().unwrap();
    assert_eq!((change.inserted, change.corrected), (0, 0));
    assert!(matches!(
        report.outcome,
        RunOutcome::Completed {
            snapshot: None,
            version: VersionOutcome::NotRequired,
            ..
        }
    ));
    assert_eq!(calls.lock().unwrap().as_slice(), &[Some(d("2024-01-01"))]);
    assert!(summaries.lock().unwrap().is_empty());
    assert!(manager.list().unwrap().is_empty());
}

#[test]
fn only_rejected_candidates_still_complete() {
    let tmp = tempdir().unwrap();
    let c = Coordinator::new(
        MemoryStore::new(),
        Box::new(StaticFetcher::new(vec![raw("2024-01-01", -1), raw("2024-01-02", 101)])),
        snapshots(&tmp),
        clock(),
    );
    let TriggerOutcome::Ran(report) = c.run_once() else {
        panic!("expected a run");
    };
    assert!(report.is_success());
    assert_eq!(report.change().unwrap().rejected, 2);
    assert!(!report.change().unwrap().has_changes());
    assert!(c.read_store(|s| s.is_empty().unwrap()));
}

/// Always fails; stops the coordinator on its `stop_after`-th call.
struct FailingFetcher {
    calls: AtomicUsize,
    stop_after: usize,
    handle: Arc<Mutex<Option<CoordinatorHandle>>>,
}

impl Fetcher for FailingFetcher {
    fn fetch(&self, _since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.stop_after {
            if let Some(h) = self.handle.lock().unwrap().as_ref() {
                h.stop();
            }
        }
        Err(FngError::Fetch("connection reset".into()))
    }
}

#[test]
fn fetch_failure_keeps_store_and_periodic_schedule() {
    let tmp = tempdir().unwrap();
    let slot = Arc::new(Mutex::new(None));
    let clock = clock();
    let start = clock.now();
    let seeded = IndexRecord::from_raw(raw("2024-01-01", 40)).unwrap();
    let c = Coordinator::new(
        MemoryStore::with_records([seeded]),
        Box::new(FailingFetcher {
            calls: AtomicUsize::new(0),
            stop_after: 2,
            handle: Arc::clone(&slot),
        }),
        snapshots(&tmp),
        clock.clone(),
    );
    *slot.lock().unwrap() = Some(c.handle());

    let interval = Duration::from_secs(6 * 3600);
    let runs = c.run_periodic(interval);

    assert_eq!(runs, 2);
    assert_eq!(clock.waits(), vec![interval]);
    assert_eq!(clock.now(), start + chrono::Duration::hours(6));
    assert!(matches!(c.state(), RunState::Failed { ref error } if error.contains("connection reset")));

    let store = c.into_store();
    assert_eq!(store.scan().unwrap(), vec![seeded]);
    let triggers: Vec<_> = store.runs().iter().map(|r| (r.trigger, r.status_str())).collect();
    assert_eq!(
        triggers,
        vec![(TriggerSource::Timer, "failed"), (TriggerSource::Timer, "failed")]
    );
}

/// Blocks its first call until released.
struct GatedFetcher {
    calls: AtomicUsize,
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl Fetcher for GatedFetcher {
    fn fetch(&self, _since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(vec![RawRecord::new(d("2024-01-01"), 50)])
    }
}

#[test]
fn triggers_during_a_run_coalesce_into_one_pending_run() {
    let tmp = tempdir().unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let fetcher = Arc::new(GatedFetcher {
        calls: AtomicUsize::new(0),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let c = Arc::new(Coordinator::new(
        MemoryStore::new(),
        Box::new(Arc::clone(&fetcher)),
        snapshots(&tmp),
        clock(),
    ));
    let handle = c.handle();

    let worker = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_once())
    };
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    assert!(handle.state().is_running());
    assert_eq!(handle.request_run(), TriggerDisposition::Coalesced);
    assert_eq!(handle.request_run(), TriggerDisposition::Coalesced);
    assert!(matches!(c.trigger(TriggerSource::Manual), TriggerOutcome::Coalesced));
    assert!(handle.has_pending());
    assert_eq!(handle.coalesced_triggers(), 3);

    release_tx.send(()).unwrap();
    assert!(matches!(worker.join().unwrap(), TriggerOutcome::Ran(_)));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(handle.has_pending(), "one-shot leaves the pending run for a loop");

    // The manual loop picks up exactly one pending run.
    let manual = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_manual())
    };
    assert!(handle.wait_for_runs(2, Duration::from_secs(10)));
    handle.stop();
    assert_eq!(manual.join().unwrap(), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert!(!handle.has_pending());
}

fn gated_coordinator(tmp: &TempDir) -> (Arc<Coordinator<MemoryStore>>, Arc<GatedFetcher>, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let fetcher = Arc::new(GatedFetcher {
        calls: AtomicUsize::new(0),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let c = Arc::new(Coordinator::new(
        MemoryStore::new(),
        Box::new(Arc::clone(&fetcher)),
        snapshots(tmp),
        clock(),
    ));
    (c, fetcher, started_rx, release_tx)
}

#[test]
fn manual_loop_waits_out_a_run_started_elsewhere() {
    let tmp = tempdir().unwrap();
    let (c, fetcher, started_rx, release_tx) = gated_coordinator(&tmp);
    let handle = c.handle();

    let one_shot = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_once())
    };
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let manual = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_manual())
    };
    assert_eq!(handle.request_run(), TriggerDisposition::Coalesced);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.coalesced_triggers(), 1, "manual loop retried while the run was in flight");
    assert_eq!(handle.runs_finished(), 0);

    release_tx.send(()).unwrap();
    assert!(matches!(one_shot.join().unwrap(), TriggerOutcome::Ran(_)));
    assert!(handle.wait_for_runs(2, Duration::from_secs(10)));
    handle.stop();
    assert_eq!(manual.join().unwrap(), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.coalesced_triggers(), 1);
}

#[test]
fn periodic_loop_waits_out_a_run_started_elsewhere() {
    let tmp = tempdir().unwrap();
    let (c, fetcher, started_rx, release_tx) = gated_coordinator(&tmp);
    let handle = c.handle();

    let one_shot = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_once())
    };
    started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let periodic = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_periodic(Duration::from_secs(3600)))
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.coalesced_triggers(), 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    assert!(matches!(one_shot.join().unwrap(), TriggerOutcome::Ran(_)));
    assert!(handle.wait_for_runs(2, Duration::from_secs(10)));
    handle.stop();
    assert!(periodic.join().unwrap() >= 1);
    assert_eq!(handle.coalesced_triggers(), 0);
}

#[test]
fn manual_mode_runs_on_request_until_stopped() {
    let tmp = tempdir().unwrap();
    let c = Arc::new(Coordinator::new(
        MemoryStore::new(),
        Box::new(StaticFetcher::new(vec![raw("2024-01-01", 30)])),
        snapshots(&tmp),
        clock(),
    ));
    let handle = c.handle();
    let manual = {
        let c = Arc::clone(&c);
        thread::spawn(move || c.run_manual())
    };

    assert_eq!(handle.request_run(), TriggerDisposition::Accepted);
    assert!(handle.wait_for_runs(1, Duration::from_secs(10)));
    handle.request_run();
    assert!(handle.wait_for_runs(2, Duration::from_secs(10)));
    handle.stop();
    assert_eq!(manual.join().unwrap(), 2);

    let c = Arc::try_unwrap(c).ok().unwrap();
    let store = c.into_store();
    let runs = store.runs();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.trigger == TriggerSource::Manual));
    assert_eq!(runs[0].change().unwrap().inserted, 1);
    assert!(!runs[1].change().unwrap().has_changes());
}

#[test]
fn periodic_mode_serves_manual_requests_between_ticks() {
    let tmp = tempdir().unwrap();
    let slot: Arc<Mutex<Option<CoordinatorHandle>>> = Arc::new(Mutex::new(None));

    /// Requests a manual run from inside the first run, stops on the third.
    struct Driver {
        calls: AtomicUsize,
        handle: Arc<Mutex<Option<CoordinatorHandle>>>,
    }
    impl Fetcher for Driver {
        fn fetch(&self, _since: Option<NaiveDate>) -> Result<Vec<RawRecord>, FngError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let guard = self.handle.lock().unwrap();
            let h = guard.as_ref().unwrap();
            match n {
                1 => assert_eq!(h.request_run(), TriggerDisposition::Coalesced),
                3 => h.stop(),
                _ => {}
            }
            Ok(Vec::new())
        }
    }

    let clock = clock();
    let c = Coordinator::new(
        MemoryStore::new(),
        Box::new(Driver {
            calls: AtomicUsize::new(0),
            handle: Arc::clone(&slot),
        }),
        snapshots(&tmp),
        clock.clone(),
    );
    *slot.lock().unwrap() = Some(c.handle());

    let interval = Duration::from_secs(3600);
    assert_eq!(c.run_periodic(interval), 3);
    // The coalesced request ran right after the first tick without moving
    // the schedule; the third run was the next timer tick.
    assert_eq!(clock.waits(), vec![interval]);
    let triggers: Vec<_> = c.into_store().runs().iter().map(|r| r.trigger).collect();
    assert_eq!(
        triggers,
        vec![TriggerSource::Timer, TriggerSource::Manual, TriggerSource::Timer]
    );
}

/// Captures what a publisher observes.
struct Observer {
    handle: Arc<Mutex<Option<CoordinatorHandle>>>,
    seen: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl Publisher for Observer {
    fn name(&self) -> &str {
        "observer"
    }

    fn publish(&self, records: &[IndexRecord], _change: &ChangeDescriptor) -> Result<(), FngError> {
        let completed = self
            .handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| matches!(h.state(), RunState::Completed { .. }))
            .unwrap_or(false);
        self.seen.lock().unwrap().push((records.len(), completed));
        Err(FngError::Io(std::io::Error::other("disk full")))
    }
}

#[test]
fn publishers_see_the_merged_series_after_completion() {
    let tmp = tempdir().unwrap();
    let slot = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let store = MemoryStore::with_records([IndexRecord::from_raw(raw("2024-01-01", 10)).unwrap()]);
    let c = Coordinator::new(
        store,
        Box::new(StaticFetcher::new(vec![raw("2024-01-02", 60)])),
        snapshots(&tmp),
        clock(),
    )
    .with_publisher(Box::new(Observer {
        handle: Arc::clone(&slot),
        seen: Arc::clone(&seen),
    }));
    *slot.lock().unwrap() = Some(c.handle());

    let TriggerOutcome::Ran(report) = c.run_once() else {
        panic!("expected a run");
    };
    // A failing publisher does not fail the run.
    assert!(report.is_success());
    assert_eq!(seen.lock().unwrap().as_slice(), &[(2, true)]);
}

#[test]
fn failed_runs_do_not_publish() {
    let tmp = tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let c = Coordinator::new(
        MemoryStore::new(),
        Box::new(FailingFetcher {
            calls: AtomicUsize::new(0),
            stop_after: usize::MAX,
            handle: Arc::new(Mutex::new(None)),
        }),
        snapshots(&tmp),
        clock(),
    )
    .with_publisher(Box::new(Observer {
        handle: Arc::new(Mutex::new(None)),
        seen: Arc::clone(&seen),
    }));
    let TriggerOutcome::Ran(report) = c.run_once() else {
        panic!("expected a run");
    };
    assert!(!report.is_success());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn merge_sequences_keep_dates_unique_ordered_and_in_range() {
    let mut store = MemoryStore::new();
    let batches = vec![
        vec![raw("2024-01-05", 50), raw("2024-01-03", 30), raw("2024-01-04", 200)],
        vec![raw("2024-01-01", 10), raw("2024-01-03", 35), raw("2024-01-03", 36)],
        vec![raw("2024-01-02", 0), raw("2024-01-05", 100), raw("2024-01-06", -3)],
    ];
    for batch in batches {
        merge(&mut store, batch).unwrap();
        let records = store.scan().unwrap();
        assert!(records.windows(2).all(|w| w[0].date < w[1].date));
        assert!(records.iter().all(|r| r.value <= 100));
        assert!(records.iter().all(|r| r.rating == Rating::from_value(r.value)));
    }
    let values: Vec<(String, u8)> = store
        .scan()
        .unwrap()
        .into_iter()
        .map(|r| (r.date.to_string(), r.value))
        .collect();
    assert_eq!(
        values,
        vec![
            ("2024-01-01".to_string(), 10),
            ("2024-01-02".to_string(), 0),
            ("2024-01-03".to_string(), 36),
            ("2024-01-05".to_string(), 100),
        ]
    );
}

#[test]
fn sqlite_pipeline_end_to_end() {
    let tmp = tempdir().unwrap();
    let db_path = tmp.path().join("fng_data.db");
    let readme = tmp.path().join("README.md");
    let clock = clock();

    let run = |batch: Vec<RawRecord>| {
        clock.advance(Duration::from_secs(3600));
        let store = SqliteStore::open(&db_path).unwrap();
        let c = Coordinator::new(
            store,
            Box::new(StaticFetcher::new(batch)),
            SnapshotManager::new(tmp.path().join("output/backups"), &db_path, 2),
            clock.clone(),
        )
        .with_publisher(Box::new(ReadmePublisher::new(&readme, 30)));
        match c.run_once() {
            TriggerOutcome::Ran(report) => report,
            TriggerOutcome::Coalesced => panic!("unexpected coalesce"),
        }
    };

    let first = run(vec![raw("2024-01-01", 20), raw("2024-01-02", 70)]);
    assert_eq!(first.change().unwrap().inserted, 2);
    let second = run(vec![raw("2024-01-02", 72), raw("2024-01-03", 55)]);
    assert_eq!(second.change().unwrap().corrected, 1);
    assert_eq!(second.change().unwrap().inserted, 1);
    let third = run(vec![raw("2024-01-03", 55)]);
    assert!(!third.change().unwrap().has_changes());
    let fourth = run(vec![raw("2024-01-04", 80)]);
    assert!(fourth.change().unwrap().has_changes());

    let store = SqliteStore::open(&db_path).unwrap();
    assert_eq!(store.len().unwrap(), 4);
    assert_eq!(store.get(d("2024-01-02")).unwrap().unwrap().value, 72);

    let runs = store.list_runs(10).unwrap();
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.status == "completed" && r.trigger == "one_shot"));

    // Three snapshots were taken; retention keeps two.
    let manager = SnapshotManager::new(tmp.path().join("output/backups"), &db_path, 2);
    let entries = manager.list().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(manager.verify().unwrap().is_empty());
    let latest = manager.load(&entries[0]).unwrap();
    assert_eq!(latest.records.len(), 4);
    assert_eq!(fs::read_dir(tmp.path().join("output/backups")).unwrap().count(), 2);

    let readme = fs::read_to_string(&readme).unwrap();
    assert!(readme.contains("| 2024-01-04 | 80 | Extreme Greed |"));
}
