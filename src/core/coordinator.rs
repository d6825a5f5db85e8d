//! Run coordination: one synchronization in flight at a time.
//!
//! The coordinator owns the store and a small gate (`Idle`, `Running`,
//! `Completed`, `Failed`) guarded by a mutex and condvar. A trigger that
//! arrives while a run is in flight is folded into a single pending flag,
//! which the manual and periodic loops pick up once the current run ends.
//!
//! Pipeline of one run: fetch from the watermark and classify the batch.
//! When it changes something, snapshot the series as it will read after the
//! merge, apply the merge, and hand the snapshot to version control.
//! Publishers (documentation and the like) see an owned, fully
//! merged copy of the series after the run reached `Completed`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, info_span, warn};

use crate::core::error::FngError;
use crate::core::record::IndexRecord;
use crate::core::snapshot::{SnapshotEntry, SnapshotManager, VersionControl, VersionOutcome};
use crate::core::store::SeriesStore;
use crate::core::sync::{self, ChangeDescriptor, Fetcher, SyncReport};
use crate::core::time::{self, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    OneShot,
    Manual,
    Timer,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::OneShot => "one_shot",
            TriggerSource::Manual => "manual",
            TriggerSource::Timer => "timer",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed { change: ChangeDescriptor },
    Failed { error: String },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        sync: SyncReport,
        snapshot: Option<SnapshotEntry>,
        version: VersionOutcome,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed { .. })
    }

    pub fn status_str(&self) -> &'static str {
        match self.outcome {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    pub fn change(&self) -> Option<&ChangeDescriptor> {
        match &self.outcome {
            RunOutcome::Completed { sync, .. } => Some(&sync.change),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Failed { error } => Some(error),
            RunOutcome::Completed { .. } => None,
        }
    }
}

/// Reader invoked with the full ordered series after a completed run.
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, records: &[IndexRecord], change: &ChangeDescriptor) -> Result<(), FngError>;
}

/// Gate contents, guarded by the coordinator's mutex.
#[derive(Debug, Default)]
pub struct GateState {
    pub(crate) state: RunState,
    pub(crate) pending: bool,
    pub(crate) stop: bool,
    pub(crate) runs_finished: u64,
    pub(crate) coalesced: u64,
}

#[derive(Debug, Default)]
struct RunGate {
    state: Mutex<GateState>,
    signal: Condvar,
}

impl RunGate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDisposition {
    /// No run in flight; a waiting loop will start one.
    Accepted,
    /// A run is in flight; the request is remembered as the single pending one.
    Coalesced,
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Ran(RunReport),
    Coalesced,
}

/// Thread-safe control surface for a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    gate: Arc<RunGate>,
}

impl CoordinatorHandle {
    /// Asks for a run as soon as possible.
    pub fn request_run(&self) -> TriggerDisposition {
        let mut gate = self.gate.lock();
        let running = gate.state.is_running();
        gate.pending = true;
        if running {
            gate.coalesced += 1;
        }
        self.gate.signal.notify_all();
        if running {
            TriggerDisposition::Coalesced
        } else {
            TriggerDisposition::Accepted
        }
    }

    /// Prevents any further scheduled or manual run. An in-flight run finishes.
    pub fn stop(&self) {
        let mut gate = self.gate.lock();
        gate.stop = true;
        self.gate.signal.notify_all();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.gate.lock().stop
    }

    pub fn state(&self) -> RunState {
        self.gate.lock().state.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.gate.lock().pending
    }

    pub fn runs_finished(&self) -> u64 {
        self.gate.lock().runs_finished
    }

    /// Triggers and requests folded into the pending flag so far.
    pub fn coalesced_triggers(&self) -> u64 {
        self.gate.lock().coalesced
    }

    /// Blocks until at least `count` runs have finished or `timeout` elapses.
    pub fn wait_for_runs(&self, count: u64, timeout: Duration) -> bool {
        let gate = self.gate.lock();
        let (gate, _) = self
            .gate
            .signal
            .wait_timeout_while(gate, timeout, |g| g.runs_finished < count)
            .unwrap_or_else(|p| p.into_inner());
        gate.runs_finished >= count
    }
}

struct PipelineResult {
    sync: SyncReport,
    snapshot: Option<SnapshotEntry>,
    version: VersionOutcome,
    records: Vec<IndexRecord>,
}

pub struct Coordinator<S: SeriesStore> {
    store: Mutex<S>,
    fetcher: Box<dyn Fetcher>,
    snapshots: SnapshotManager,
    version_control: Option<Box<dyn VersionControl>>,
    strict_version_control: bool,
    publishers: Vec<Box<dyn Publisher>>,
    clock: Arc<dyn Clock>,
    gate: Arc<RunGate>,
}

impl<S: SeriesStore> Coordinator<S> {
    pub fn new(
        store: S,
        fetcher: Box<dyn Fetcher>,
        snapshots: SnapshotManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            fetcher,
            snapshots,
            version_control: None,
            strict_version_control: false,
            publishers: Vec::new(),
            clock,
            gate: Arc::new(RunGate::default()),
        }
    }

    pub fn with_version_control(mut self, vc: Box<dyn VersionControl>) -> Self {
        self.version_control = Some(vc);
        self
    }

    /// When set, a version-control failure fails the run.
    pub fn strict_version_control(mut self, strict: bool) -> Self {
        self.strict_version_control = strict;
        self
    }

    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn state(&self) -> RunState {
        self.gate.lock().state.clone()
    }

    /// Read access to the store between runs.
    pub fn read_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        f(&store)
    }

    pub fn into_store(self) -> S {
        self.store.into_inner().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts a run now unless one is already in flight, in which case the
    /// trigger is coalesced into the pending flag.
    pub fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        {
            let mut gate = self.gate.lock();
            if gate.state.is_running() {
                gate.pending = true;
                gate.coalesced += 1;
                info!(trigger = source.as_str(), "run in flight; trigger coalesced");
                return TriggerOutcome::Coalesced;
            }
            gate.state = RunState::Running;
            gate.pending = false;
        }

        let (report, published) = self.execute(source);

        {
            let mut gate = self.gate.lock();
            gate.state = match &report.outcome {
                RunOutcome::Completed { sync, .. } => RunState::Completed {
                    change: sync.change.clone(),
                },
                RunOutcome::Failed { error } => RunState::Failed {
                    error: error.clone(),
                },
            };
            gate.runs_finished += 1;
            self.gate.signal.notify_all();
        }

        if let Some((records, change)) = published {
            self.publish(&records, &change);
        }

        TriggerOutcome::Ran(report)
    }

    /// Runs once. Requests made before the run starts are absorbed by it;
    /// only those arriving mid-run stay pending for a loop to pick up.
    pub fn run_once(&self) -> TriggerOutcome {
        self.trigger(TriggerSource::OneShot)
    }

    /// Runs now, then again `interval` after each timer run finishes, until
    /// stopped. Manual requests during the wait run immediately without
    /// moving the timer schedule. Returns the number of runs executed.
    pub fn run_periodic(&self, interval: Duration) -> u64 {
        let mut executed = 0;
        let mut next_due = self.clock.now();
        info!(interval_secs = interval.as_secs(), "periodic scheduling started");

        loop {
            let source = {
                let mut gate = self.gate.lock();
                loop {
                    if gate.stop {
                        info!(runs = executed, "stop requested; periodic scheduling ended");
                        return executed;
                    }
                    if gate.state.is_running() {
                        // Started elsewhere; its end wakes us.
                        gate = self.gate.signal.wait(gate).unwrap_or_else(|p| p.into_inner());
                        continue;
                    }
                    if gate.pending {
                        break TriggerSource::Manual;
                    }
                    let now = self.clock.now();
                    if now >= next_due {
                        break TriggerSource::Timer;
                    }
                    let remaining = (next_due - now).to_std().unwrap_or(Duration::ZERO);
                    gate = self.clock.wait(&self.gate.signal, gate, remaining);
                }
            };

            if let TriggerOutcome::Ran(report) = self.trigger(source) {
                executed += 1;
                log_report(&report);
            }
            if source == TriggerSource::Timer {
                next_due = self.clock.now()
                    + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::hours(24));
            }
        }
    }

    /// Idles until a run is requested through a handle, runs once, and goes
    /// back to idle. Returns the number of runs executed once stopped.
    pub fn run_manual(&self) -> u64 {
        let mut executed = 0;
        loop {
            {
                let gate = self.gate.lock();
                let gate = self
                    .gate
                    .signal
                    .wait_while(gate, |g| !g.stop && (!g.pending || g.state.is_running()))
                    .unwrap_or_else(|p| p.into_inner());
                if gate.stop {
                    info!(runs = executed, "stop requested; manual mode ended");
                    return executed;
                }
            }
            if let TriggerOutcome::Ran(report) = self.trigger(TriggerSource::Manual) {
                executed += 1;
                log_report(&report);
            }
        }
    }

    fn execute(&self, source: TriggerSource) -> (RunReport, Option<(Vec<IndexRecord>, ChangeDescriptor)>) {
        let run_id = time::new_event_id();
        let span = info_span!("sync_run", run_id = %run_id, trigger = source.as_str());
        let _enter = span.enter();

        let started_at = self.clock.now();
        let mut store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let result = self.pipeline(&mut *store);
        let finished_at = self.clock.now();

        let (outcome, published) = match result {
            Ok(p) => {
                let change = p.sync.change.clone();
                (
                    RunOutcome::Completed {
                        sync: p.sync,
                        snapshot: p.snapshot,
                        version: p.version,
                    },
                    Some((p.records, change)),
                )
            }
            Err(e) => {
                error!(error = %e, transient = e.is_transient(), "run failed");
                (RunOutcome::Failed { error: e.to_string() }, None)
            }
        };

        let report = RunReport {
            run_id,
            trigger: source,
            started_at,
            finished_at,
            outcome,
        };
        if let Err(e) = store.record_run(&report) {
            warn!(error = %e, "could not journal run");
        }
        (report, published)
    }

    fn pipeline(&self, store: &mut S) -> Result<PipelineResult, FngError> {
        let pending = sync::prepare(&*store, &self.fetcher)?;
        let (records, change) = pending.preview(&*store)?;

        if !change.has_changes() {
            let sync = sync::commit(store, pending)?;
            info!("no changes; snapshot skipped");
            return Ok(PipelineResult {
                sync,
                snapshot: None,
                version: VersionOutcome::NotRequired,
                records,
            });
        }

        // The backup is written before the store moves: a failed write leaves
        // the batch unapplied and the next run fetches it again.
        let snapshot = self.snapshots.create(&records, &change, self.clock.now())?;
        let sync = match sync::commit(store, pending) {
            Ok(sync) => sync,
            Err(e) => {
                if let Err(discard) = self.snapshots.discard(&snapshot) {
                    warn!(path = %snapshot.path, error = %discard, "could not discard snapshot of unapplied merge");
                }
                return Err(e);
            }
        };
        let version = self.hand_off(&snapshot, &sync.change.summary())?;
        Ok(PipelineResult {
            sync,
            snapshot: Some(snapshot),
            version,
            records,
        })
    }

    fn hand_off(&self, snapshot: &SnapshotEntry, summary: &str) -> Result<VersionOutcome, FngError> {
        let Some(vc) = &self.version_control else {
            return Ok(VersionOutcome::Disabled);
        };
        match vc.record(Path::new(&snapshot.path), summary) {
            Ok(receipt) => {
                info!(collaborator = vc.name(), ?receipt, "snapshot handed to version control");
                Ok(VersionOutcome::Recorded { receipt })
            }
            Err(e) if self.strict_version_control => Err(match e {
                FngError::VersionControl(_) => e,
                other => FngError::VersionControl(other.to_string()),
            }),
            Err(e) => {
                warn!(collaborator = vc.name(), error = %e, "version control failed; run continues");
                Ok(VersionOutcome::Failed { error: e.to_string() })
            }
        }
    }

    fn publish(&self, records: &[IndexRecord], change: &ChangeDescriptor) {
        for p in &self.publishers {
            match p.publish(records, change) {
                Ok(()) => info!(publisher = p.name(), "published"),
                Err(e) => warn!(publisher = p.name(), error = %e, "publisher failed"),
            }
        }
    }
}

fn log_report(report: &RunReport) {
    match &report.outcome {
        RunOutcome::Completed { sync, .. } => info!(
            run_id = %report.run_id,
            inserted = sync.change.inserted,
            corrected = sync.change.corrected,
            "run completed"
        ),
        RunOutcome::Failed { error } => warn!(run_id = %report.run_id, %error, "run failed; will retry on next trigger"),
    }
}
