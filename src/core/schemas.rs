//! Database schema definitions.
//!
//! A single SQLite file holds the series, the snapshot index, and the run
//! journal.

pub const FNG_DB_NAME: &str = "fng_data.db";

pub const FNG_DB_SCHEMA_DATA: &str = "
    CREATE TABLE IF NOT EXISTS fng_data (
        date TEXT PRIMARY KEY,
        value INTEGER NOT NULL CHECK (value BETWEEN 0 AND 100),
        rating TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const FNG_DB_SCHEMA_SNAPSHOTS: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        summary TEXT NOT NULL,
        inserted INTEGER NOT NULL,
        corrected INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const FNG_DB_SCHEMA_RUNS: &str = "
    CREATE TABLE IF NOT EXISTS sync_runs (
        run_id TEXT PRIMARY KEY,
        trigger_source TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        status TEXT NOT NULL,
        inserted INTEGER NOT NULL DEFAULT 0,
        corrected INTEGER NOT NULL DEFAULT 0,
        rejected INTEGER NOT NULL DEFAULT 0,
        error TEXT
    )
";

pub const FNG_DB_SCHEMA_RUNS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at)";

pub const ALL_SCHEMAS: &[&str] = &[
    FNG_DB_SCHEMA_DATA,
    FNG_DB_SCHEMA_SNAPSHOTS,
    FNG_DB_SCHEMA_RUNS,
    FNG_DB_SCHEMA_RUNS_INDEX,
];
