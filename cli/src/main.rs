//! ShareSync - Command-line interface for the transfer engine.
//!
//! Starts, resumes and stops runs, sweeps abandoned runs and inspects the
//! ledger. Progress goes to stderr; listings go to stdout.

mod progress;

use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::{
    join_remote, resolve_credentials, AdapterFactory, CancellationController, Collaborators,
    DedupStore, DirectorySource, EngineConfig, EnvCredentialStore, ExecutionMode,
    InterruptOutcome, LivenessReconciler, MountedShareConnector, ProtocolAdapter,
    ReconcileReport, RunEngine, RunOutcome, RunStatus, RunStore, SqliteLedger, StopOutcome,
    TemplateRenderer, TriggerSource,
};
use progress::CliProgress;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "sharesync.toml";

const EXIT_OK: i32 = 0;
/// The run ended without transferring everything
const EXIT_INCOMPLETE: i32 = 1;
const EXIT_ERROR: i32 = 2;
const EXIT_PAUSED: i32 = 3;

/// ShareSync - resumable, verified transfers to network shares
#[derive(Parser, Debug)]
#[command(name = "sharesync")]
#[command(version)]
#[command(about = "Copy job items to network shares, resumably and without duplicates")]
struct Cli {
    /// Configuration file (defaults to ./sharesync.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "engine=debug"
    #[arg(long, global = true, value_name = "FILTER", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a run of a configured job
    Run {
        #[arg(long, value_name = "JOB_ID")]
        job: String,

        /// What started the run: manual, schedule or startup
        #[arg(long, value_name = "TRIGGER", default_value = "manual")]
        trigger: String,

        /// Record the run as executing in the background
        #[arg(long)]
        background: bool,

        /// Pause for continuation after this many seconds
        #[arg(long, value_name = "SECS")]
        time_budget: Option<u64>,

        #[arg(long)]
        verbose: bool,
    },

    /// Continue a paused run
    Resume {
        #[arg(long, value_name = "RUN_ID")]
        run: Uuid,

        #[arg(long, value_name = "TOKEN")]
        cursor: String,

        #[arg(long, value_name = "SECS")]
        time_budget: Option<u64>,

        #[arg(long)]
        verbose: bool,
    },

    /// Stop a running run immediately
    Stop {
        #[arg(long, value_name = "RUN_ID")]
        run: Uuid,
    },

    /// Ask a running run to cancel at its next item boundary
    Cancel {
        #[arg(long, value_name = "RUN_ID")]
        run: Uuid,
    },

    /// Mark a running run as interrupted
    Interrupt {
        #[arg(long, value_name = "RUN_ID")]
        run: Uuid,

        #[arg(long, value_name = "TEXT")]
        reason: String,
    },

    /// Finalize runs whose heartbeat went stale
    Reconcile {
        /// Keep sweeping periodically
        #[arg(long)]
        watch: bool,

        /// Seconds between sweeps (defaults to reconciler.watch_interval_secs)
        #[arg(long, value_name = "SECS", requires = "watch")]
        interval: Option<u64>,

        /// Stop after this many sweeps
        #[arg(long, value_name = "N", requires = "watch")]
        count: Option<usize>,
    },

    /// List configured jobs
    Jobs,

    /// List recent runs, newest first
    Runs {
        #[arg(long, value_name = "JOB_ID")]
        job: Option<String>,

        /// Only runs that have not finished
        #[arg(long, conflicts_with = "job")]
        active: bool,

        #[arg(long, value_name = "N", default_value_t = 20)]
        limit: usize,
    },

    /// Show the log of a run
    Logs {
        #[arg(long, value_name = "RUN_ID")]
        run: Uuid,
    },

    /// List the items already transferred for a job
    Dedup {
        #[arg(long, value_name = "JOB_ID")]
        job: String,
    },

    /// Delete every run, log and dedup record of a job
    ForgetJob {
        #[arg(long, value_name = "JOB_ID")]
        job: String,
    },

    /// Check that a destination is reachable with its credentials
    TestConnection {
        #[arg(long, value_name = "DESTINATION_ID")]
        destination: String,
    },

    /// List directories at a destination
    ListDirs {
        #[arg(long, value_name = "DESTINATION_ID")]
        destination: String,

        /// Path below the destination's base path
        #[arg(long, value_name = "PATH", default_value = "")]
        path: String,
    },
}

/// Loaded configuration and the ledger it points at.
struct Workspace {
    config: EngineConfig,
    ledger: Arc<SqliteLedger>,
}

impl Workspace {
    fn open(config_path: Option<&Path>) -> Result<Self, String> {
        let config = load_config(config_path)?;
        let ledger = SqliteLedger::open(&config.database).map_err(|e| {
            format!("Failed to open ledger {}: {}", config.database.display(), e)
        })?;
        Ok(Workspace {
            config,
            ledger: Arc::new(ledger),
        })
    }

    fn engine(&self, time_budget: Option<u64>) -> RunEngine {
        let catalog = Arc::new(self.config.catalog());
        let mut settings = self.config.engine_settings();
        if let Some(secs) = time_budget {
            settings.time_budget = Some(Duration::from_secs(secs));
        }

        RunEngine::new(
            Collaborators {
                runs: self.ledger.clone(),
                dedup: self.ledger.clone(),
                jobs: catalog.clone(),
                destinations: catalog,
                credentials: Arc::new(EnvCredentialStore::default()),
                items: Arc::new(DirectorySource),
                renderer: Arc::new(TemplateRenderer),
                adapters: Arc::new(MountedShareConnector::new(&self.config.mount_root)),
            },
            settings,
        )
    }

    fn reconciler(&self) -> LivenessReconciler {
        LivenessReconciler::new(self.ledger.clone(), self.config.reconciler_settings())
    }

    fn controller(&self) -> CancellationController {
        CancellationController::new(self.ledger.clone())
    }

    /// Connect to a configured destination. Configuration problems are
    /// errors; connection failures are reported and yield `None`.
    fn connect(&self, destination_id: &str) -> Result<Option<(Box<dyn ProtocolAdapter>, String)>, String> {
        let catalog = self.config.catalog();
        let destination = catalog
            .destination(destination_id)
            .ok_or_else(|| format!("Unknown destination '{}'", destination_id))?;
        let credentials = resolve_credentials(&EnvCredentialStore::default(), destination)
            .map_err(|e| e.to_string())?;

        let connector = MountedShareConnector::new(&self.config.mount_root);
        let options = self.config.engine_settings().transfer_options();
        match connector.connect(destination, &credentials, &options) {
            Ok(adapter) => Ok(Some((adapter, destination.base_path.clone()))),
            Err(e) => {
                eprintln!("Connection failed ({}): {}", e.kind(), e);
                Ok(None)
            }
        }
    }
}

/// Read the configuration. Relative paths in it are taken relative to the
/// directory holding the file.
fn load_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    let (mut config, base) = match path {
        Some(path) => {
            let config = EngineConfig::load(path).map_err(|e| e.to_string())?;
            (config, path.parent().map(Path::to_path_buf).unwrap_or_default())
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            let config = EngineConfig::load(DEFAULT_CONFIG).map_err(|e| e.to_string())?;
            (config, PathBuf::new())
        }
        None => {
            info!("no {} found, using defaults", DEFAULT_CONFIG);
            (EngineConfig::default(), PathBuf::new())
        }
    };

    config.database = anchor(&base, &config.database);
    config.mount_root = anchor(&base, &config.mount_root);
    for job in &mut config.jobs {
        job.source_root = anchor(&base, &job.source_root);
    }
    Ok(config)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Exit code for the end of an engine invocation.
fn exit_code_for(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Paused { .. } => EXIT_PAUSED,
        RunOutcome::Finished(run) if run.status == RunStatus::Success => EXIT_OK,
        RunOutcome::Finished(_) => EXIT_INCOMPLETE,
    }
}

fn report_outcome(outcome: &RunOutcome) -> i32 {
    let run = outcome.run();
    match outcome {
        RunOutcome::Paused { cursor, .. } => {
            println!("{} PAUSED", run.run_id);
            println!(
                "Resume with: sharesync resume --run {} --cursor '{}'",
                run.run_id, cursor
            );
        }
        RunOutcome::Finished(_) => println!("{} {}", run.run_id, run.status),
    }
    exit_code_for(outcome)
}

fn print_sweep(report: &ReconcileReport) {
    println!(
        "Examined {} active runs: {} canceled, {} interrupted",
        report.examined, report.canceled, report.interrupted
    );
}

fn run_cli(cli: &Cli) -> Result<i32, String> {
    let workspace = Workspace::open(cli.config.as_deref())?;

    match &cli.command {
        Command::Run {
            job,
            trigger,
            background,
            time_budget,
            verbose,
        } => {
            let trigger = TriggerSource::parse(&trigger.to_lowercase()).ok_or_else(|| {
                format!(
                    "Invalid trigger '{}'. Must be 'manual', 'schedule' or 'startup'",
                    trigger
                )
            })?;
            let mode = if *background {
                ExecutionMode::Background
            } else {
                ExecutionMode::Foreground
            };

            // Close runs left behind by a previous process before adding one
            match workspace.reconciler().sweep(Utc::now()) {
                Ok(report) if report.canceled + report.interrupted > 0 => {
                    eprintln!(
                        "Reconciled {} stale runs before starting",
                        report.canceled + report.interrupted
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "startup reconciler sweep failed"),
            }

            let progress = CliProgress::new(*verbose);
            let outcome = workspace
                .engine(*time_budget)
                .start_run(job, trigger, mode, Some(&progress))
                .map_err(|e| format!("Run failed to start: {}", e))?;
            Ok(report_outcome(&outcome))
        }

        Command::Resume {
            run,
            cursor,
            time_budget,
            verbose,
        } => {
            let progress = CliProgress::new(*verbose);
            let outcome = workspace
                .engine(*time_budget)
                .resume_run(*run, cursor, Some(&progress))
                .map_err(|e| format!("Resume failed: {}", e))?;
            Ok(report_outcome(&outcome))
        }

        Command::Stop { run } => {
            let outcome = workspace
                .controller()
                .stop_run(*run)
                .map_err(|e| e.to_string())?;
            stop_exit_code(*run, outcome, "stopped")
        }

        Command::Cancel { run } => {
            let outcome = workspace
                .controller()
                .request_cancel(*run)
                .map_err(|e| e.to_string())?;
            stop_exit_code(*run, outcome, "asked to cancel")
        }

        Command::Interrupt { run, reason } => {
            match workspace
                .controller()
                .interrupt_run(*run, reason)
                .map_err(|e| e.to_string())?
            {
                InterruptOutcome::Interrupted => {
                    println!("Run {} interrupted", run);
                    Ok(EXIT_OK)
                }
                InterruptOutcome::NotActive => {
                    eprintln!("Run {} is not running", run);
                    Ok(EXIT_INCOMPLETE)
                }
                InterruptOutcome::NotFound => Err(format!("Run {} not found", run)),
            }
        }

        Command::Reconcile {
            watch,
            interval,
            count,
        } => {
            let reconciler = workspace.reconciler();
            if !*watch {
                let report = reconciler
                    .sweep(Utc::now())
                    .map_err(|e| format!("Reconciler sweep failed: {}", e))?;
                print_sweep(&report);
                return Ok(EXIT_OK);
            }

            let period = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| workspace.config.watch_interval());
            if period.is_zero() {
                return Err("Sweep interval must be greater than zero".to_string());
            }
            watch_sweeps(&reconciler, period, *count);
            Ok(EXIT_OK)
        }

        Command::Jobs => {
            for job_id in workspace.config.catalog().job_ids() {
                println!("{}", job_id);
            }
            Ok(EXIT_OK)
        }

        Command::Runs { job, active, limit } => {
            let runs = if *active {
                workspace.ledger.list_active_runs(*limit)
            } else {
                workspace.ledger.list_runs(job.as_deref(), *limit)
            }
            .map_err(|e| e.to_string())?;

            for run in runs {
                let c = run.counters;
                println!(
                    "{}  {:<16} {:<16} {}  scanned={} uploaded={} skipped={} failed={}",
                    run.run_id,
                    run.job_id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    c.scanned,
                    c.uploaded,
                    c.skipped,
                    c.failed
                );
            }
            Ok(EXIT_OK)
        }

        Command::Logs { run } => {
            if workspace.ledger.get_run(*run).map_err(|e| e.to_string())?.is_none() {
                return Err(format!("Run {} not found", run));
            }
            for entry in workspace.ledger.logs_for_run(*run).map_err(|e| e.to_string())? {
                match entry.detail {
                    Some(detail) => println!(
                        "{} {:<5} {} ({})",
                        entry.timestamp.to_rfc3339(),
                        entry.severity.as_str(),
                        entry.message,
                        detail
                    ),
                    None => println!(
                        "{} {:<5} {}",
                        entry.timestamp.to_rfc3339(),
                        entry.severity.as_str(),
                        entry.message
                    ),
                }
            }
            Ok(EXIT_OK)
        }

        Command::Dedup { job } => {
            for record in workspace
                .ledger
                .dedup_records_for_job(job)
                .map_err(|e| e.to_string())?
            {
                println!(
                    "{} -> {} ({})",
                    record.item_id,
                    record.remote_path,
                    record.uploaded_at.to_rfc3339()
                );
            }
            Ok(EXIT_OK)
        }

        Command::ForgetJob { job } => {
            let purge = workspace.ledger.delete_job(job).map_err(|e| e.to_string())?;
            println!(
                "Deleted {} runs, {} log entries and {} dedup records for job '{}'",
                purge.runs, purge.logs, purge.dedup_records, job
            );
            Ok(EXIT_OK)
        }

        Command::TestConnection { destination } => {
            let Some((adapter, _)) = workspace.connect(destination)? else {
                return Ok(EXIT_INCOMPLETE);
            };
            match adapter.test_connection() {
                Ok(report) => {
                    println!(
                        "Connected to {} ({} top-level directories)",
                        report.location, report.top_level_directories
                    );
                    Ok(EXIT_OK)
                }
                Err(e) => {
                    eprintln!("Connection test failed ({}): {}", e.kind(), e);
                    Ok(EXIT_INCOMPLETE)
                }
            }
        }

        Command::ListDirs { destination, path } => {
            let Some((adapter, base_path)) = workspace.connect(destination)? else {
                return Ok(EXIT_INCOMPLETE);
            };
            let target = join_remote(&base_path, path);
            match adapter.list_directories(&target) {
                Ok(names) => {
                    for name in names {
                        println!("{}", name);
                    }
                    Ok(EXIT_OK)
                }
                Err(e) => {
                    eprintln!("Listing failed ({}): {}", e.kind(), e);
                    Ok(EXIT_INCOMPLETE)
                }
            }
        }
    }
}

fn stop_exit_code(run_id: Uuid, outcome: StopOutcome, verb: &str) -> Result<i32, String> {
    match outcome {
        StopOutcome::Requested => {
            println!("Run {} {}", run_id, verb);
            Ok(EXIT_OK)
        }
        StopOutcome::AlreadyRequested => {
            println!("Run {} already has a stop pending", run_id);
            Ok(EXIT_OK)
        }
        StopOutcome::NotActive => {
            eprintln!("Run {} has already finished", run_id);
            Ok(EXIT_INCOMPLETE)
        }
        StopOutcome::NotFound => Err(format!("Run {} not found", run_id)),
    }
}

/// Sweep now and then on every tick. Ledger errors are logged and the
/// next tick retries.
fn watch_sweeps(reconciler: &LivenessReconciler, period: Duration, count: Option<usize>) {
    let ticker = crossbeam_channel::tick(period);
    let mut sweeps = 0usize;

    loop {
        match reconciler.sweep(Utc::now()) {
            Ok(report) => print_sweep(&report),
            Err(e) => error!(error = %e, "reconciler sweep failed"),
        }
        sweeps += 1;

        if count.is_some_and(|limit| sweeps >= limit) {
            break;
        }
        if ticker.recv().is_err() {
            break;
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match run_cli(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_ERROR);
        }
    }
}
