//! Serialized, audited database access.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

use crate::core::db;
use crate::core::error::FngError;
use crate::core::time;

pub const AUDIT_LOG_NAME: &str = "broker.events.jsonl";

/// Every database operation goes through here: connections are opened
/// under one process-wide lock, and each operation leaves one line in the
/// audit log next to the database.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

/// One line of `broker.events.jsonl`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db: String,
    pub status: String,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(AUDIT_LOG_NAME),
        }
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    pub fn with_conn<F, R>(&self, db_path: &Path, actor: &str, op: &str, f: F) -> Result<R, FngError>
    where
        F: FnOnce(&Connection) -> Result<R, FngError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _guard = DB_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let started = Instant::now();
        let result = db::db_connect(db_path).and_then(|conn| f(&conn));

        let event = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db: db_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            status: if result.is_ok() { "success" } else { "error" }.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        // The operation has already taken effect; audit failures are only logged.
        if let Err(e) = self.append(&event) {
            warn!(op, path = %self.audit_log_path.display(), error = %e, "could not append broker audit event");
        }
        result
    }

    fn append(&self, event: &BrokerEvent) -> Result<(), FngError> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)?;
        writeln!(log, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// Audit log contents, oldest first.
    pub fn read_events(&self) -> Result<Vec<BrokerEvent>, FngError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        fs::read_to_string(&self.audit_log_path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(FngError::from))
            .collect()
    }
}
