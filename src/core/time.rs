//! Timestamps, event ids, and the clock used by the run coordinator.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use ulid::Ulid;

use crate::core::coordinator::GateState;

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    format!("{}Z", Utc::now().timestamp())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// RFC 3339 with second precision, e.g. `2024-01-02T03:04:05Z`.
pub fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Compact form used in file names, e.g. `20240102T030405Z`.
pub fn compact_stamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

/// Time source and suspension point for the scheduling loop.
///
/// `wait` releases the coordinator's gate while suspended so that manual
/// triggers and stop requests can get through; it may return early.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    fn wait<'a>(
        &self,
        signal: &Condvar,
        guard: MutexGuard<'a, GateState>,
        timeout: Duration,
    ) -> MutexGuard<'a, GateState>;
}

/// Wall clock; waits block on the condvar.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn wait<'a>(
        &self,
        signal: &Condvar,
        guard: MutexGuard<'a, GateState>,
        timeout: Duration,
    ) -> MutexGuard<'a, GateState> {
        match signal.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

/// Virtual clock: every wait returns at once and advances time by the full
/// timeout.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    waits: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            waits: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    /// Timeouts passed to `wait`, in call order.
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wait<'a>(
        &self,
        _signal: &Condvar,
        guard: MutexGuard<'a, GateState>,
        timeout: Duration,
    ) -> MutexGuard<'a, GateState> {
        self.waits.lock().unwrap_or_else(|p| p.into_inner()).push(timeout);
        self.advance(timeout);
        guard
    }
}
