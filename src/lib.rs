//! fng: a local tracker for the CNN Fear & Greed index.
//!
//! **fng keeps a durable, deduplicated daily history of the index and
//! records every change to it.**
//!
//! Each run fetches from the store's watermark (its latest date), merges the
//! batch by date, and when anything was inserted or corrected writes a
//! timestamped snapshot and commits it to the surrounding git repository.
//!
//! # Architecture
//!
//! ## Store
//!
//! - SQLite database (`fng_data.db`) with one row per date
//! - Every connection goes through `DbBroker`, which serializes access and
//!   appends to `broker.events.jsonl`
//! - Finished runs are journaled in `sync_runs`
//!
//! ## Coordinator
//!
//! One run in flight at a time. Triggers that arrive mid-run collapse into a
//! single pending run. Three modes:
//!
//! - `once`: a single run, exit status reflects the outcome
//! - `periodic`: run now, then every interval until Ctrl-C
//! - `manual`: run on each Enter (or `run`) until `q` or end of input
//!
//! # Examples
//!
//! ```bash
//! # Import a history file and catch up from the API
//! fng init --csv fear-greed.csv
//!
//! # Daily updates
//! fng sync --mode periodic --interval-hours 24
//!
//! # Inspect
//! fng status
//! fng gaps --days 60 --fill
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: records, stores, the merge engine, snapshots, coordination
//! - [`plugins`]: the CNN fetcher, CSV import, git, README and export output

pub mod core;
pub mod plugins;

use core::{
    config::{CONFIG_FILE_NAME, Config, Layout},
    coordinator::{
        Coordinator, CoordinatorHandle, RunOutcome, RunReport, TriggerDisposition, TriggerOutcome,
        TriggerSource,
    },
    db::SqliteStore,
    error::FngError,
    record::{IndexRecord, format_date, parse_date},
    snapshot::{SnapshotManager, VersionOutcome, VersionReceipt},
    store::{SeriesStore, StoreStats},
    sync::Fetcher,
    time::{self, Clock, SystemClock},
};
use plugins::{
    docs::ReadmePublisher,
    export::{self, ExportFormat},
    fetcher::{CnnFetcher, SinceOverride, StaticFetcher, read_history_csv},
    gaps,
    git::GitVersionControl,
};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(
    name = "fng",
    version = env!("CARGO_PKG_VERSION"),
    about = "Incremental Fear & Greed index tracker"
)]
struct Cli {
    /// Project root holding the database, snapshots and README (defaults to the current directory).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Configuration file (defaults to `<root>/fng.toml` when present).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Append logs to this file instead of stderr.
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SyncMode {
    Once,
    Periodic,
    Manual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
struct SyncCli {
    #[clap(long, value_enum, default_value = "once")]
    mode: SyncMode,
    /// Overrides `schedule.interval_hours` in periodic mode.
    #[clap(long)]
    interval_hours: Option<u64>,
    /// Skip the git commit for this invocation.
    #[clap(long)]
    no_git: bool,
}

#[derive(clap::Args, Debug)]
struct InitCli {
    /// History CSV to import first. Repeatable; later files win on shared dates.
    #[clap(long)]
    csv: Vec<PathBuf>,
    /// Do not contact the API after importing.
    #[clap(long)]
    skip_fetch: bool,
    #[clap(long)]
    no_git: bool,
}

#[derive(clap::Args, Debug)]
struct ExportCli {
    #[clap(long, value_enum, default_value = "csv")]
    format: ExportFormat,
    /// Output file (stdout when omitted).
    #[clap(long)]
    out: Option<PathBuf>,
    /// First date to include (YYYY-MM-DD).
    #[clap(long)]
    from: Option<String>,
    /// Last date to include (YYYY-MM-DD).
    #[clap(long)]
    to: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Show indexed snapshots, newest first.
    List,
    /// Re-hash every snapshot and report mismatches.
    Verify,
    /// Apply the retention limit now.
    Prune,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, merge, snapshot and commit.
    Sync(SyncCli),
    /// Create the store, import history files, and run a first sync.
    Init(InitCli),
    /// Summarize the store and recent runs.
    Status {
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List dates missing from the recent history.
    Gaps {
        #[clap(long, default_value_t = 90)]
        days: u32,
        /// Refetch from the earliest weekday gap.
        #[clap(long)]
        fill: bool,
        #[clap(long)]
        no_git: bool,
    },
    /// Write the series as CSV or JSON.
    Export(ExportCli),
    /// Regenerate the README from the store.
    Docs,
    /// Inspect and maintain snapshots.
    #[clap(subcommand)]
    Snapshots(SnapshotCommand),
    /// Print the version.
    Version,
}

struct Context {
    config: Config,
    layout: Layout,
}

fn init_tracing(log_file: Option<&Path>) -> Result<(), FngError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .try_init()
        }
        None => registry.with(fmt::layer().with_writer(io::stderr)).try_init(),
    };
    result.map_err(|e| FngError::Config(format!("logging: {}", e)))
}

pub fn run() -> Result<(), FngError> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing(cli.log_file.as_deref())?;

    let root = match cli.root {
        Some(r) => r,
        None => std::env::current_dir()?,
    };
    let config = Config::load(&root, cli.config.as_deref())?;
    let layout = Layout::resolve(&root, &config);
    let ctx = Context { config, layout };

    match cli.command {
        Command::Sync(args) => cmd_sync(&ctx, args),
        Command::Init(args) => cmd_init(&ctx, args),
        Command::Status { format } => cmd_status(&ctx, format),
        Command::Gaps { days, fill, no_git } => cmd_gaps(&ctx, days, fill, no_git),
        Command::Export(args) => cmd_export(&ctx, args),
        Command::Docs => {
            let store = SqliteStore::open(&ctx.layout.db_path)?;
            let path = readme_publisher(&ctx).write(&store.scan()?)?;
            println!("{} {}", "Wrote".green(), path.display());
            Ok(())
        }
        Command::Snapshots(cmd) => cmd_snapshots(&ctx, cmd),
        Command::Version => Ok(()),
    }
}

fn snapshot_manager(ctx: &Context) -> SnapshotManager {
    SnapshotManager::new(
        ctx.layout.snapshots_dir.clone(),
        ctx.layout.db_path.clone(),
        ctx.config.storage.max_snapshots,
    )
}

fn readme_publisher(ctx: &Context) -> ReadmePublisher {
    ReadmePublisher::new(ctx.layout.readme_path.clone(), ctx.config.docs.trend_days)
}

fn build_coordinator(
    ctx: &Context,
    fetcher: Box<dyn Fetcher>,
    no_git: bool,
) -> Result<Coordinator<SqliteStore>, FngError> {
    let store = SqliteStore::open(&ctx.layout.db_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut coordinator = Coordinator::new(store, fetcher, snapshot_manager(ctx), clock)
        .strict_version_control(ctx.config.version_control.strict)
        .with_publisher(Box::new(readme_publisher(ctx)));

    if ctx.config.version_control.enabled && !no_git {
        coordinator = coordinator.with_version_control(Box::new(GitVersionControl::new(
            ctx.layout.repo_root.clone(),
            ctx.config.version_control.push,
        )));
    }
    Ok(coordinator)
}

/// Runs once and turns a failed run into an error for the exit status.
fn run_checked(coordinator: &Coordinator<SqliteStore>, source: TriggerSource) -> Result<RunReport, FngError> {
    match coordinator.trigger(source) {
        TriggerOutcome::Ran(report) => {
            print_report(&report);
            match report.error() {
                Some(e) => Err(FngError::RunFailed(e.to_string())),
                None => Ok(report),
            }
        }
        TriggerOutcome::Coalesced => Err(FngError::RunFailed("a run is already in progress".into())),
    }
}

fn print_report(report: &RunReport) {
    match &report.outcome {
        RunOutcome::Completed { sync, snapshot, version } => {
            let change = &sync.change;
            let headline = if change.has_changes() {
                change.summary().green().bold()
            } else {
                format!("No changes ({} records)", change.total_records).normal()
            };
            println!("{} {}", "✓".green(), headline);
            if change.rejected > 0 {
                println!("  {} {} candidate(s) rejected", "!".yellow(), change.rejected);
            }
            if let Some(entry) = snapshot {
                println!("  snapshot: {}", entry.path.dimmed());
            }
            match version {
                VersionOutcome::Recorded {
                    receipt: VersionReceipt::Committed { pushed },
                } => println!("  git: committed{}", if *pushed { " and pushed" } else { "" }),
                VersionOutcome::Recorded {
                    receipt: VersionReceipt::Skipped { reason },
                } => println!("  git: skipped ({})", reason),
                VersionOutcome::Failed { error } => println!("  {} git: {}", "!".yellow(), error),
                VersionOutcome::Disabled | VersionOutcome::NotRequired => {}
            }
        }
        RunOutcome::Failed { error } => {
            println!("{} run {} failed: {}", "✗".red(), report.run_id, error.red());
        }
    }
}

/// Reads commands from stdin: `run` requests a run, `q`/`quit` stops. In
/// interactive mode an empty line also requests a run and end of input stops.
fn spawn_stdin_listener(handle: CoordinatorHandle, interactive: bool) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "q" | "quit" => {
                    handle.stop();
                    return;
                }
                "run" => announce(handle.request_run()),
                "" if interactive => announce(handle.request_run()),
                other => println!("unknown command {:?} (run, q)", other),
            }
        }
        if interactive {
            handle.stop();
        }
    });
}

fn announce(disposition: TriggerDisposition) {
    if disposition == TriggerDisposition::Coalesced {
        println!("{}", "run in progress; another run is queued".yellow());
    }
}

fn install_ctrlc(handle: CoordinatorHandle) -> Result<(), FngError> {
    ctrlc::set_handler(move || {
        info!("interrupt received; stopping after the current run");
        handle.stop();
    })
    .map_err(|e| FngError::Config(format!("signal handler: {}", e)))
}

fn cmd_sync(ctx: &Context, args: SyncCli) -> Result<(), FngError> {
    let fetcher = CnnFetcher::new(&ctx.config.source)?;
    let coordinator = build_coordinator(ctx, Box::new(fetcher), args.no_git)?;

    match args.mode {
        SyncMode::Once => run_checked(&coordinator, TriggerSource::OneShot).map(|_| ()),
        SyncMode::Periodic => {
            let interval = match args.interval_hours {
                Some(0) => return Err(FngError::Config("--interval-hours must be positive".into())),
                Some(h) => Duration::from_secs(h * 3600),
                None => ctx.config.interval(),
            };
            let handle = coordinator.handle();
            install_ctrlc(handle.clone())?;
            spawn_stdin_listener(handle, false);
            println!(
                "Syncing every {}h. Type {} for an immediate run, Ctrl-C to stop.",
                interval.as_secs() / 3600,
                "run".bold()
            );
            let runs = coordinator.run_periodic(interval);
            println!("Stopped after {} run(s).", runs);
            Ok(())
        }
        SyncMode::Manual => {
            let handle = coordinator.handle();
            install_ctrlc(handle.clone())?;
            spawn_stdin_listener(handle, true);
            println!("Press Enter to sync, {} to quit.", "q".bold());
            let runs = coordinator.run_manual();
            println!("Stopped after {} run(s).", runs);
            Ok(())
        }
    }
}

fn cmd_init(ctx: &Context, args: InitCli) -> Result<(), FngError> {
    fs::create_dir_all(&ctx.layout.root)?;
    let config_path = ctx.layout.root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        fs::write(&config_path, toml::to_string_pretty(&ctx.config)?)?;
        println!("{} {}", "Created".green(), config_path.display());
    }
    SqliteStore::open(&ctx.layout.db_path)?;

    if !args.csv.is_empty() {
        let mut batch = Vec::new();
        for path in &args.csv {
            let import = read_history_csv(path)?;
            println!(
                "Read {} row(s) from {}{}",
                import.records.len(),
                path.display(),
                if import.skipped > 0 {
                    format!(", skipped {}", import.skipped)
                } else {
                    String::new()
                }
            );
            if import.skipped > 0 {
                warn!(path = %path.display(), skipped = import.skipped, "unreadable CSV rows");
            }
            batch.extend(import.records);
        }
        let coordinator = build_coordinator(ctx, Box::new(StaticFetcher::new(batch)), args.no_git)?;
        run_checked(&coordinator, TriggerSource::OneShot)?;
    }

    if !args.skip_fetch {
        let fetcher = CnnFetcher::new(&ctx.config.source)?;
        let coordinator = build_coordinator(ctx, Box::new(fetcher), args.no_git)?;
        run_checked(&coordinator, TriggerSource::OneShot)?;
    }
    Ok(())
}

fn cmd_status(ctx: &Context, format: OutputFormat) -> Result<(), FngError> {
    let store = SqliteStore::open(&ctx.layout.db_path)?;
    let stats = StoreStats::from_records(&store.scan()?);
    let runs = store.list_runs(5)?;
    let snapshots = snapshot_manager(ctx).list()?;

    if format == OutputFormat::Json {
        let body = time::command_envelope(
            "status",
            "ok",
            serde_json::json!({
                "db_path": ctx.layout.db_path,
                "stats": stats,
                "recent_runs": runs,
                "snapshots": snapshots.len(),
            }),
        );
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("{}", "Fear & Greed store".bold());
    println!("  database:  {}", ctx.layout.db_path.display());
    println!("  records:   {}", stats.total_records);
    let (Some(earliest), Some(latest)) = (stats.earliest_date, stats.latest_date) else {
        println!("  {}", "empty; run `fng init` or `fng sync`".yellow());
        return Ok(());
    };
    println!("  coverage:  {} to {}", format_date(earliest), format_date(latest));
    if let (Some(value), Some(rating)) = (stats.latest_value, stats.latest_rating) {
        println!("  latest:    {} ({})", value.to_string().bold(), rating);
    }
    println!("  mean:      {:.2} (7d {:.2}, 30d {:.2})", stats.avg_value, stats.avg_7d, stats.avg_30d);
    println!("  snapshots: {}", snapshots.len());

    if !runs.is_empty() {
        println!("{}", "Recent runs".bold());
        for r in &runs {
            let status = if r.status == "completed" {
                r.status.green()
            } else {
                r.status.red()
            };
            println!(
                "  {} {:<9} {:<8} +{} ~{} !{}{}",
                r.started_at,
                status,
                r.trigger,
                r.inserted,
                r.corrected,
                r.rejected,
                r.error.as_deref().map(|e| format!("  {}", e)).unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn cmd_gaps(ctx: &Context, days: u32, fill: bool, no_git: bool) -> Result<(), FngError> {
    let store = SqliteStore::open(&ctx.layout.db_path)?;
    let report = gaps::analyze_gaps(&store, SystemClock.today(), days)?;
    println!(
        "{} to {}: {} weekday gap(s), {} weekend gap(s)",
        format_date(report.window_start),
        format_date(report.window_end),
        report.weekday.len(),
        report.weekend.len()
    );
    for day in &report.weekday {
        println!("  {}", format_date(*day).yellow());
    }

    if !fill {
        return Ok(());
    }
    let Some(start) = report.earliest_weekday_gap() else {
        println!("Nothing to fill.");
        return Ok(());
    };
    let fetcher = SinceOverride::new(CnnFetcher::new(&ctx.config.source)?, start);
    let coordinator = build_coordinator(ctx, Box::new(fetcher), no_git)?;
    run_checked(&coordinator, TriggerSource::Manual).map(|_| ())
}

fn cmd_export(ctx: &Context, args: ExportCli) -> Result<(), FngError> {
    let store = SqliteStore::open(&ctx.layout.db_path)?;
    let from = args.from.as_deref().map(parse_date).transpose()?;
    let to = args.to.as_deref().map(parse_date).transpose()?;
    let records: Vec<IndexRecord> = store
        .scan()?
        .into_iter()
        .filter(|r| from.is_none_or(|f| r.date >= f) && to.is_none_or(|t| r.date <= t))
        .collect();

    match &args.out {
        Some(path) => {
            let mut out = BufWriter::new(fs::File::create(path)?);
            export::export_records(&records, args.format, &mut out)?;
            out.flush()?;
            eprintln!("Exported {} record(s) to {}", records.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            export::export_records(&records, args.format, &mut out)?;
        }
    }
    Ok(())
}

fn cmd_snapshots(ctx: &Context, cmd: SnapshotCommand) -> Result<(), FngError> {
    let manager = snapshot_manager(ctx);
    match cmd {
        SnapshotCommand::List => {
            let entries = manager.list()?;
            if entries.is_empty() {
                println!("No snapshots.");
            }
            for e in entries {
                println!("{}  {:>6} records  {}", e.created_at, e.record_count, e.summary);
                println!("  {}", e.path.dimmed());
            }
            Ok(())
        }
        SnapshotCommand::Verify => {
            let failures = manager.verify()?;
            if failures.is_empty() {
                println!("{}", "All snapshots verified.".green());
                return Ok(());
            }
            for f in &failures {
                println!("{} {}", "✗".red(), f);
            }
            Err(FngError::Validation(format!(
                "{} snapshot(s) failed verification",
                failures.len()
            )))
        }
        SnapshotCommand::Prune => {
            let removed = manager.prune()?;
            println!("Removed {} snapshot(s).", removed.len());
            Ok(())
        }
    }
}
