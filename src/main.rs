//! councilwatch CLI.
//!
//! `--check` prints what changed without touching anything. `--update`
//! reprocesses changed meetings and sends the operator notification.
//! `--lock-status` reports whether an update run currently holds the lock.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};

use councilwatch_lib::archive::ArchiveLayout;
use councilwatch_lib::config::{Config, Secrets, VideoIndexSource};
use councilwatch_lib::db::{MeetingDb, MeetingStore, UnavailableStore};
use councilwatch_lib::detector::ChangeDetector;
use councilwatch_lib::error::UpdateError;
use councilwatch_lib::lock::{FileRunLock, LockStatus, RunLock};
use councilwatch_lib::notifier::{HttpPushTransport, Notifier};
use councilwatch_lib::orchestrator::{render_apply_summary, render_report, Orchestrator};
use councilwatch_lib::reprocess::CommandReprocessor;
use councilwatch_lib::video_index::{HttpVideoIndex, JsonFileVideoIndex, VideoIndex};

#[derive(Debug, Parser)]
#[command(name = "councilwatch", version, about)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["check", "update", "lock_status"])
))]
struct Cli {
    /// Detect changes and print a report; no reprocessing, no notification
    #[arg(long)]
    check: bool,

    /// Detect changes, reprocess changed meetings, then notify
    #[arg(long)]
    update: bool,

    /// Show whether an update run holds the lock
    #[arg(long)]
    lock_status: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,

    /// Config file (default: ~/.councilwatch/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn build_video_index(
    config: &Config,
    secrets: &Secrets,
) -> Result<Option<Box<dyn VideoIndex>>, UpdateError> {
    match config.video_index_source() {
        None => Ok(None),
        Some(VideoIndexSource::File(path)) => Ok(Some(Box::new(JsonFileVideoIndex::new(path)))),
        Some(VideoIndexSource::Http(url)) => {
            let index = HttpVideoIndex::new(url, secrets.video_api_key.clone())
                .map_err(|e| UpdateError::Configuration(format!("video index client: {}", e)))?;
            Ok(Some(Box::new(index)))
        }
    }
}

fn render_lock_status(status: &LockStatus) -> String {
    match status {
        LockStatus::Free => "Lock is free\n".to_string(),
        LockStatus::Held {
            pid,
            acquired_at,
            age_secs,
        } => format!(
            "Lock held by pid {} since {} ({}s)\n",
            pid, acquired_at, age_secs
        ),
        LockStatus::Stale {
            pid,
            acquired_at,
            age_secs,
        } => format!(
            "Lock is stale: pid {} since {} ({}s); the next update run reclaims it\n",
            pid, acquired_at, age_secs
        ),
    }
}

fn print_output<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => log::error!("Failed to serialize output: {}", e),
        }
    } else {
        print!("{}", text());
    }
}

async fn run(cli: Cli) -> Result<(), UpdateError> {
    let config_path = match cli.config {
        Some(p) => p,
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)?;
    let secrets = Secrets::from_env();

    let lock = FileRunLock::new(
        &config.state_dir()?,
        &config.lock_name,
        config.lock_stale_after(),
    );

    if cli.lock_status {
        let status = lock.status().map_err(|e| UpdateError::Lock(e.to_string()))?;
        print_output(cli.json, &status, || render_lock_status(&status));
        return Ok(());
    }

    let archive = ArchiveLayout::new(&config.archive_path);
    let store: Box<dyn MeetingStore> =
        match MeetingDb::open_readonly(&config.database_path, archive.clone()) {
            Ok(db) => Box::new(db),
            Err(e) => {
                log::warn!("Meeting store unavailable: {}", e);
                Box::new(UnavailableStore::new(e.to_string()))
            }
        };
    let video_index = build_video_index(&config, &secrets)?;

    let detector = ChangeDetector::new(archive);
    let orchestrator = Orchestrator::new(&detector, store.as_ref(), video_index.as_deref());

    if cli.check {
        let outcome = orchestrator.run_update_check().await?;
        print_output(cli.json, &outcome, || render_report(&outcome));
        return Ok(());
    }

    let reprocessor = CommandReprocessor::new(
        config.reprocess_command.clone(),
        config.reprocess_timeout(),
    )
    .map_err(|e| UpdateError::Configuration(format!("reprocessCommand: {}", e)))?;

    let transport = HttpPushTransport::new(config.notify_timeout())
        .map_err(|e| UpdateError::Configuration(format!("notification client: {}", e)))?;
    let notifier = Notifier::new(config.notifier_config(&secrets), transport);

    let summary = orchestrator
        .run_update_mode(&lock, &reprocessor, &notifier)
        .await?;
    print_output(cli.json, &summary, || render_apply_summary(&summary));
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_informational() => {
            log::info!("{}", e);
            eprintln!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
        Err(e) => {
            log::error!("{}", e);
            eprintln!("{}\n{}", e, e.recovery_suggestion());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
