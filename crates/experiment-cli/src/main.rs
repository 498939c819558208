use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use contracts::{read_config_file, ExperimentConfig};
use experiment_api::{
    serve, HttpRemoteSink, LogSubmitter, RuntimeSettings, SqlitePreferencesStore, ENV_LOG_DIR,
    ENV_SQLITE_PATH, ENV_UPLOAD_URL,
};
use experiment_core::{
    layout_source_from_config, simulate_session, BotProfile, EventLog, MemoryPreferencesStore,
    Session, SessionDeps, SimulationReport, SyntheticParticipant,
};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SIMULATION_LIMIT_MS: u64 = 4 * 60 * 60 * 1000;

#[derive(Debug, Parser)]
#[command(name = "experiment-cli")]
#[command(about = "Runs and inspects effort-decision experiment sessions")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the session HTTP/WebSocket API.
    Serve(ServeArgs),
    /// Run synthetic participants and write their CSV logs.
    Simulate(SimulateArgs),
    /// Upload backed-up logs that never reached the remote sink.
    Resubmit(ResubmitArgs),
    /// Parse a layout and print the grid it produces.
    CheckLayout(CheckLayoutArgs),
}

#[derive(Debug, Args)]
struct StorageArgs {
    #[arg(long, env = ENV_LOG_DIR)]
    log_dir: Option<PathBuf>,

    #[arg(long, env = ENV_SQLITE_PATH)]
    sqlite_path: Option<PathBuf>,

    #[arg(long, env = ENV_UPLOAD_URL)]
    upload_url: Option<String>,
}

impl StorageArgs {
    fn is_empty(&self) -> bool {
        self.log_dir.is_none() && self.sqlite_path.is_none() && self.upload_url.is_none()
    }

    fn settings(&self, config: &ExperimentConfig) -> RuntimeSettings {
        let mut settings = RuntimeSettings::from_config(config);
        if let Some(dir) = self.log_dir.as_ref() {
            settings.log_dir = dir.clone();
            settings.backup_dir = dir.join("backup");
        }
        if self.sqlite_path.is_some() {
            settings.sqlite_path = self.sqlite_path.clone();
        }
        if self.upload_url.is_some() {
            settings.upload_url = self.upload_url.clone();
        }
        settings
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    #[command(flatten)]
    storage: StorageArgs,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Experiment config JSON; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Synthetic participant profile JSON.
    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(long, default_value_t = 8)]
    participants: u32,

    /// Participant i runs with seed `seed + i`.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, default_value = "simulated_logs")]
    out_dir: PathBuf,
}

#[derive(Debug, Args)]
struct ResubmitArgs {
    /// Backup files to upload. When empty, pending entries in the SQLite ledger are used.
    backups: Vec<PathBuf>,

    #[arg(long, env = ENV_UPLOAD_URL)]
    upload_url: String,

    #[arg(long, env = ENV_SQLITE_PATH)]
    sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CheckLayoutArgs {
    /// Experiment config whose layout section is checked.
    #[arg(long, conflicts_with = "file")]
    config: Option<PathBuf>,

    /// Plain layout file, one grid row per line.
    #[arg(long)]
    file: Option<PathBuf>,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig, String> {
    match path {
        Some(path) => read_config_file(path)
            .map_err(|err| format!("failed to load config {}: {err}", path.display())),
        None => Ok(ExperimentConfig::default()),
    }
}

fn load_profile(path: Option<&Path>) -> Result<BotProfile, String> {
    let Some(path) = path else {
        return Ok(BotProfile::default());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read profile {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid profile {}: {err}", path.display()))
}

async fn run_serve(args: ServeArgs) -> Result<(), String> {
    let settings = if args.storage.is_empty() {
        None
    } else {
        Some(args.storage.settings(&ExperimentConfig::default()))
    };
    info!(addr = %args.addr, fixed_settings = settings.is_some(), "starting session api");
    serve(args.addr, settings)
        .await
        .map_err(|err| format!("server failed: {err}"))
}

fn run_simulation(args: SimulateArgs) -> Result<(), String> {
    let base = load_config(args.config.as_deref())?;
    let profile = load_profile(args.profile.as_deref())?;
    std::fs::create_dir_all(&args.out_dir)
        .map_err(|err| format!("failed to create {}: {err}", args.out_dir.display()))?;
    let started_at = Utc::now();

    let results = (0..args.participants)
        .into_par_iter()
        .map(|index| {
            let seed = args.seed.wrapping_add(u64::from(index));
            let mut config = base.clone();
            config.seed = seed;
            config.participant.participant_id = format!("SIM{seed:04}");

            let log = EventLog::open(&args.out_dir, &config.participant.participant_id, started_at)
                .map_err(|err| format!("participant {index}: {err}"))?;
            let mut session = Session::new(
                config.clone(),
                SessionDeps {
                    layout: layout_source_from_config(&config.layout),
                    store: Box::new(MemoryPreferencesStore::new()),
                    log,
                },
            );
            let mut bot = SyntheticParticipant::new(profile.clone(), seed, &config);
            Ok(simulate_session(&mut session, &mut bot, SIMULATION_LIMIT_MS))
        })
        .collect::<Vec<Result<SimulationReport, String>>>();

    let mut failures = 0;
    for result in results {
        match result {
            Ok(report) => {
                let line = serde_json::to_string(&report)
                    .map_err(|err| format!("failed to encode report: {err}"))?;
                println!("{line}");
            }
            Err(err) => {
                failures += 1;
                eprintln!("{err}");
            }
        }
    }

    if failures > 0 {
        return Err(format!("{failures} simulated session(s) failed to start"));
    }
    Ok(())
}

async fn run_resubmit(args: ResubmitArgs) -> Result<(), String> {
    let mut backups = args.backups.clone();
    if backups.is_empty() {
        let Some(path) = args.sqlite_path.as_ref() else {
            return Err("pass backup files or --sqlite-path to read pending submissions".to_string());
        };
        let store = SqlitePreferencesStore::open(path)
            .map_err(|err| format!("failed to open {}: {err}", path.display()))?;
        backups = store
            .pending_submissions()
            .map_err(|err| format!("failed to read pending submissions: {err}"))?
            .into_iter()
            .filter(|record| !record.backup_path.is_empty())
            .map(|record| PathBuf::from(record.backup_path))
            .collect();
    }
    if backups.is_empty() {
        println!("nothing to resubmit");
        return Ok(());
    }

    let sink = Arc::new(HttpRemoteSink::new(args.upload_url.clone()));
    let mut submitter = LogSubmitter::new(sink, std::env::temp_dir());
    if let Some(path) = args.sqlite_path.as_ref() {
        submitter = submitter.with_ledger(path);
    }

    let mut failed = 0;
    for backup in &backups {
        match submitter.resubmit(backup).await {
            Ok(report) if report.uploaded => {
                println!("uploaded {} after {} attempt(s)", backup.display(), report.attempts);
            }
            Ok(report) => {
                failed += 1;
                warn!(backup = %backup.display(), error = ?report.last_error, "resubmission failed");
                println!("failed {}", backup.display());
            }
            Err(err) => {
                failed += 1;
                println!("failed {}: {err}", backup.display());
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {} log(s) still pending", backups.len()));
    }
    Ok(())
}

fn run_check_layout(args: CheckLayoutArgs) -> Result<(), String> {
    let mut layout_config = load_config(args.config.as_deref())?.layout;
    if let Some(file) = args.file.as_ref() {
        layout_config.path = Some(file.display().to_string());
    }

    let mut source = layout_source_from_config(&layout_config);
    let grid = source
        .load()
        .map_err(|err| format!("{} is not a usable layout: {err}", source.describe()))?;

    println!("source: {}", source.describe());
    println!(
        "size: {}x{} walkable: {}",
        grid.width(),
        grid.height(),
        grid.walkable_cells().count()
    );
    for row in grid.render() {
        println!("{row}");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Simulate(args) => run_simulation(args),
        Command::Resubmit(args) => run_resubmit(args).await,
        Command::CheckLayout(args) => run_check_layout(args),
    };

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
