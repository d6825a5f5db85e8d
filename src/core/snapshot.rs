//! Timestamped snapshots of the series and the hand-off to version control.
//!
//! A snapshot is a JSON document holding every record at the time of a
//! changing merge, indexed in the `snapshots` table with its SHA-256 hash.
//! Only the newest `max_snapshots` files are kept.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::FngError;
use crate::core::record::IndexRecord;
use crate::core::sync::ChangeDescriptor;
use crate::core::time;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotEntry {
    pub id: String,
    pub path: String,
    pub content_hash: String,
    pub summary: String,
    pub inserted: i64,
    pub corrected: i64,
    pub record_count: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: String,
    pub created_at: String,
    pub summary: String,
    pub change: ChangeDescriptor,
    pub records: Vec<IndexRecord>,
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct SnapshotManager {
    dir: PathBuf,
    index_db: PathBuf,
    max_snapshots: usize,
    index_ready: AtomicBool,
}

impl SnapshotManager {
    /// `index_db` is the database holding the `snapshots` table.
    pub fn new(dir: impl Into<PathBuf>, index_db: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            dir: dir.into(),
            index_db: index_db.into(),
            max_snapshots: max_snapshots.max(1),
            index_ready: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn with_index<F, R>(&self, op: &str, f: F) -> Result<R, FngError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<R, FngError>,
    {
        if !self.index_ready.load(Ordering::Acquire) {
            db::initialize_fng_db(&self.index_db)?;
            self.index_ready.store(true, Ordering::Release);
        }
        let root = self.index_db.parent().unwrap_or_else(|| Path::new("."));
        DbBroker::new(root).with_conn(&self.index_db, "fng", op, f)
    }

    /// Writes the snapshot file, indexes it, then prunes old ones.
    pub fn create(
        &self,
        records: &[IndexRecord],
        change: &ChangeDescriptor,
        now: DateTime<Utc>,
    ) -> Result<SnapshotEntry, FngError> {
        fs::create_dir_all(&self.dir)?;

        let id = time::new_event_id();
        let created_at = time::rfc3339(now);
        let summary = change.summary();
        let doc = SnapshotDocument {
            id: id.clone(),
            created_at: created_at.clone(),
            summary: summary.clone(),
            change: change.clone(),
            records: records.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let file_name = format!("snapshot_{}_{}.json", time::compact_stamp(now), id);
        let path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!(".{}.tmp", file_name));
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        let entry = SnapshotEntry {
            id,
            path: path.to_string_lossy().to_string(),
            content_hash: hash_bytes(&bytes),
            summary,
            inserted: change.inserted as i64,
            corrected: change.corrected as i64,
            record_count: records.len() as i64,
            created_at,
        };

        self.with_index("snapshots.register", |conn| {
            conn.execute(
                "INSERT INTO snapshots(id, path, content_hash, summary, inserted, corrected, record_count, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.path,
                    entry.content_hash,
                    entry.summary,
                    entry.inserted,
                    entry.corrected,
                    entry.record_count,
                    entry.created_at
                ],
            )?;
            Ok(())
        })?;
        info!(path = %entry.path, records = entry.record_count, "snapshot written");

        let pruned = self.prune()?;
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned old snapshots");
        }
        Ok(entry)
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<SnapshotEntry>, FngError> {
        self.with_index("snapshots.list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, content_hash, summary, inserted, corrected, record_count, created_at
                 FROM snapshots ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SnapshotEntry {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    content_hash: row.get(2)?,
                    summary: row.get(3)?,
                    inserted: row.get(4)?,
                    corrected: row.get(5)?,
                    record_count: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    /// Drops everything beyond the newest `max_snapshots`. Returns removed ids.
    pub fn prune(&self) -> Result<Vec<String>, FngError> {
        let entries = self.list()?;
        let stale: Vec<SnapshotEntry> = entries.into_iter().skip(self.max_snapshots).collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        for entry in &stale {
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %entry.path, "snapshot file already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let ids: Vec<String> = stale.into_iter().map(|e| e.id).collect();
        self.with_index("snapshots.prune", |conn| {
            for id in &ids {
                conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
            }
            Ok(())
        })?;
        Ok(ids)
    }

    /// Removes one snapshot file and its index row.
    pub fn discard(&self, entry: &SnapshotEntry) -> Result<(), FngError> {
        match fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.with_index("snapshots.discard", |conn| {
            conn.execute("DELETE FROM snapshots WHERE id = ?1", params![entry.id])?;
            Ok(())
        })
    }

    /// Re-hashes every indexed snapshot. Returns one message per problem.
    pub fn verify(&self) -> Result<Vec<String>, FngError> {
        let mut failures = Vec::new();
        for entry in self.list()? {
            let path = Path::new(&entry.path);
            if !path.exists() {
                failures.push(format!("Snapshot {}: file missing at {}", entry.id, entry.path));
                continue;
            }
            let bytes = fs::read(path)?;
            if hash_bytes(&bytes) != entry.content_hash {
                failures.push(format!("Snapshot {}: content hash mismatch", entry.id));
            }
        }
        Ok(failures)
    }

    pub fn load(&self, entry: &SnapshotEntry) -> Result<SnapshotDocument, FngError> {
        let bytes = fs::read(&entry.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// What a version-control collaborator did with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VersionReceipt {
    Committed { pushed: bool },
    Skipped { reason: String },
}

/// Records a snapshot and its change summary in an external history.
pub trait VersionControl: Send + Sync {
    fn name(&self) -> &str;

    fn record(&self, snapshot: &Path, summary: &str) -> Result<VersionReceipt, FngError>;
}

/// Version-control result as carried in a run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VersionOutcome {
    /// No snapshot was taken, so nothing was handed over.
    NotRequired,
    Disabled,
    Recorded { receipt: VersionReceipt },
    Failed { error: String },
}
