use crate::core::broker::DbBroker;
use crate::core::coordinator::RunReport;
use crate::core::error::FngError;
use crate::core::record::{IndexRecord, format_date};
use crate::core::schemas;
use crate::core::store::SeriesStore;
use crate::core::time;
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const ACTOR: &str = "fng";

pub fn db_connect(db_path: &Path) -> Result<Connection, FngError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    Ok(conn)
}

/// Creates the database file and every table if missing.
pub fn initialize_fng_db(db_path: &Path) -> Result<(), FngError> {
    let root = db_root(db_path);
    fs::create_dir_all(&root)?;

    let broker = DbBroker::new(&root);
    broker.with_conn(db_path, ACTOR, "db.init", |conn| {
        for schema in schemas::ALL_SCHEMAS {
            conn.execute(schema, [])?;
        }
        Ok(())
    })
}

fn db_root(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// One row of the run journal.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub trigger: String,
    pub started_at: String,
    pub finished_at: String,
    pub status: String,
    pub inserted: i64,
    pub corrected: i64,
    pub rejected: i64,
    pub error: Option<String>,
}

/// SQLite-backed series store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    root: PathBuf,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (and initializes if needed) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, FngError> {
        initialize_fng_db(db_path)?;
        Ok(Self {
            root: db_root(db_path),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn broker(&self) -> DbBroker {
        DbBroker::new(&self.root)
    }

    pub fn with_conn<F, R>(&self, op_name: &str, f: F) -> Result<R, FngError>
    where
        F: FnOnce(&Connection) -> Result<R, FngError>,
    {
        self.broker().with_conn(&self.db_path, ACTOR, op_name, f)
    }

    fn query_records(&self, op: &str, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<IndexRecord>, FngError> {
        self.with_conn(op, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(args, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (date, value, rating) = row?;
                out.push(IndexRecord::from_persisted(&date, value, &rating)?);
            }
            Ok(out)
        })
    }

    fn query_date(&self, op: &str, sql: &str) -> Result<Option<NaiveDate>, FngError> {
        let raw: Option<String> = self.with_conn(op, |conn| {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        })?;
        raw.map(|s| crate::core::record::parse_date(&s)).transpose()
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>, FngError> {
        self.with_conn("runs.list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, trigger_source, started_at, finished_at, status, inserted, corrected, rejected, error
                 FROM sync_runs ORDER BY started_at DESC, run_id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    trigger: row.get(1)?,
                    started_at: row.get(2)?,
                    finished_at: row.get(3)?,
                    status: row.get(4)?,
                    inserted: row.get(5)?,
                    corrected: row.get(6)?,
                    rejected: row.get(7)?,
                    error: row.get(8)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }
}

impl SeriesStore for SqliteStore {
    fn latest_date(&self) -> Result<Option<NaiveDate>, FngError> {
        self.query_date("data.latest", "SELECT MAX(date) FROM fng_data")
    }

    fn earliest_date(&self) -> Result<Option<NaiveDate>, FngError> {
        self.query_date("data.earliest", "SELECT MIN(date) FROM fng_data")
    }

    fn get(&self, date: NaiveDate) -> Result<Option<IndexRecord>, FngError> {
        let key = format_date(date);
        let mut found = self.query_records(
            "data.get",
            "SELECT date, value, rating FROM fng_data WHERE date = ?1",
            &[&key as &dyn rusqlite::ToSql],
        )?;
        Ok(found.pop())
    }

    fn scan(&self) -> Result<Vec<IndexRecord>, FngError> {
        self.query_records(
            "data.scan",
            "SELECT date, value, rating FROM fng_data ORDER BY date ASC",
            &[],
        )
    }

    fn scan_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<IndexRecord>, FngError> {
        let (from, to) = (format_date(from), format_date(to));
        self.query_records(
            "data.scan_range",
            "SELECT date, value, rating FROM fng_data WHERE date BETWEEN ?1 AND ?2 ORDER BY date ASC",
            &[&from as &dyn rusqlite::ToSql, &to],
        )
    }

    fn len(&self) -> Result<usize, FngError> {
        let n: i64 = self.with_conn("data.count", |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM fng_data", [], |row| row.get(0))?)
        })?;
        Ok(n as usize)
    }

    fn apply(&mut self, records: &[IndexRecord]) -> Result<(), FngError> {
        if records.is_empty() {
            return Ok(());
        }
        let now = time::rfc3339(Utc::now());
        self.with_conn("data.apply", |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO fng_data(date, value, rating, created_at, updated_at)
                     VALUES(?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(date) DO UPDATE SET
                        value = excluded.value,
                        rating = excluded.rating,
                        updated_at = excluded.updated_at",
                )?;
                for r in records {
                    stmt.execute(params![format_date(r.date), r.value as i64, r.rating.as_str(), now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn record_run(&mut self, report: &RunReport) -> Result<(), FngError> {
        let change = report.change();
        self.with_conn("runs.record", |conn| {
            conn.execute(
                "INSERT INTO sync_runs(run_id, trigger_source, started_at, finished_at, status, inserted, corrected, rejected, error)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    report.run_id,
                    report.trigger.as_str(),
                    time::rfc3339(report.started_at),
                    time::rfc3339(report.finished_at),
                    report.status_str(),
                    change.map(|c| c.inserted as i64).unwrap_or(0),
                    change.map(|c| c.corrected as i64).unwrap_or(0),
                    change.map(|c| c.rejected as i64).unwrap_or(0),
                    report.error(),
                ],
            )?;
            Ok(())
        })
    }
}
