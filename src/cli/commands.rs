//! CLI command definitions and handlers.
//!
//! The CLI is a thin shell over engine operations: `init` lays down the
//! `.aurelia/` skeleton, `start` runs the heartbeat loop in the foreground,
//! `stop` signals a running engine, and `status`/`monitor`/`report` are
//! read-only consumers of the event log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::engine::{init_project, process_alive, Runtime, RuntimeOptions};
use crate::events::EventLog;
use crate::state::{CandidateState, RuntimeSnapshot, StateStore};

/// Exit code for "precondition not met" outcomes (already initialized, not
/// running).
const EXIT_UNAVAILABLE: i32 = 2;

/// Autonomous code-improvement runtime.
#[derive(Parser)]
#[command(name = "aurelia")]
#[command(about = "Autonomous code-improvement runtime")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Project root directory.
    #[arg(long, default_value = ".", global = true)]
    pub project_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create the .aurelia/ skeleton; fails if already initialized.
    Init,

    /// Run the heartbeat loop in the foreground.
    Start {
        /// Use the mock LLM client and local sandbox (no Docker required).
        #[arg(long)]
        mock: bool,
    },

    /// Send SIGTERM to the running engine.
    Stop,

    /// Print a one-shot projection of the runtime state.
    Status,

    /// Poll the event log and print the projection periodically.
    Monitor {
        /// Polling interval in seconds.
        #[arg(long, default_value = "2.0")]
        poll_interval: f64,
    },

    /// Summarize the last run from the event log.
    Report,
}

/// Parse CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Execute the parsed command, returning the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    let project_dir = cli
        .project_dir
        .canonicalize()
        .unwrap_or(cli.project_dir.clone());

    match cli.command {
        Commands::Init => cmd_init(&project_dir),
        Commands::Start { mock } => cmd_start(&project_dir, mock).await,
        Commands::Stop => cmd_stop(&project_dir),
        Commands::Status => cmd_status(&project_dir),
        Commands::Monitor { poll_interval } => cmd_monitor(&project_dir, poll_interval).await,
        Commands::Report => cmd_report(&project_dir),
    }
}

fn cmd_init(project_dir: &Path) -> anyhow::Result<i32> {
    match init_project(project_dir) {
        Ok(()) => {
            println!("Initialized .aurelia/ in {}", project_dir.display());
            Ok(0)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            eprintln!("Already initialized: {}/.aurelia", project_dir.display());
            Ok(EXIT_UNAVAILABLE)
        }
        Err(e) => Err(e).context("initialize project"),
    }
}

async fn cmd_start(project_dir: &Path, mock: bool) -> anyhow::Result<i32> {
    let runtime = Runtime::build(
        project_dir,
        RuntimeOptions {
            mock,
            handle_signals: true,
        },
    )
    .context("assemble runtime")?;

    let reason = runtime.start().await.context("heartbeat loop")?;
    info!(reason = reason.as_str(), "engine exited");
    Ok(0)
}

fn cmd_stop(project_dir: &Path) -> anyhow::Result<i32> {
    let pid_path = project_dir.join(".aurelia").join("pid");
    let Ok(raw) = std::fs::read_to_string(&pid_path) else {
        eprintln!("No pid file found; is the engine running?");
        return Ok(EXIT_UNAVAILABLE);
    };
    let pid: i32 = raw.trim().parse().context("parse pid file")?;

    if !process_alive(pid) {
        eprintln!("Process {pid} not running; removing stale pid file.");
        let _ = std::fs::remove_file(&pid_path);
        return Ok(EXIT_UNAVAILABLE);
    }

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .context("send SIGTERM")?;
    println!("Sent SIGTERM to process {pid}.");
    Ok(0)
}

fn cmd_status(project_dir: &Path) -> anyhow::Result<i32> {
    match load_snapshot(project_dir)? {
        Some(snapshot) => print_snapshot(&snapshot),
        None => println!("No event log found; has the engine ever started?"),
    }
    Ok(0)
}

async fn cmd_monitor(project_dir: &Path, poll_interval: f64) -> anyhow::Result<i32> {
    loop {
        match load_snapshot(project_dir)? {
            Some(snapshot) => {
                println!("--- {}", chrono::Utc::now().to_rfc3339());
                print_snapshot(&snapshot);
                if snapshot.stopped {
                    println!("Runtime stopped.");
                    return Ok(0);
                }
            }
            None => println!("No event log yet."),
        }
        tokio::time::sleep(Duration::from_secs_f64(poll_interval.max(0.1))).await;
    }
}

fn cmd_report(project_dir: &Path) -> anyhow::Result<i32> {
    let Some(snapshot) = load_snapshot(project_dir)? else {
        println!("No event log found; nothing to report.");
        return Ok(0);
    };

    println!("# Aurelia run report\n");
    println!("Candidates: {}", snapshot.candidates.len());
    for candidate in snapshot.candidates.values() {
        let detail = match (&candidate.metrics, &candidate.error) {
            (Some(metrics), _) => serde_json::to_string(metrics).unwrap_or_default(),
            (None, Some(error)) => format!("{}: {}", error.kind, error.message),
            _ => String::new(),
        };
        println!(
            "  {:>4}  {:<14} parent={:<6} {}",
            candidate.id,
            format!("{:?}", candidate.state).to_lowercase(),
            candidate
                .parent_id
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            detail
        );
    }
    if let Some(best) = snapshot.best_candidate() {
        println!(
            "\nBest so far: candidate {} on branch {}",
            best.id, best.branch
        );
    }
    println!(
        "\nLLM calls: {} ({} cached), tokens in/out: {}/{}, tool invocations: {}",
        snapshot.usage.llm_calls,
        snapshot.usage.llm_calls_cached,
        snapshot.usage.tokens_in,
        snapshot.usage.tokens_out,
        snapshot.usage.tools_invoked
    );
    Ok(0)
}

/// Rebuild the state projection from the event log on disk.
fn load_snapshot(project_dir: &Path) -> anyhow::Result<Option<RuntimeSnapshot>> {
    let aurelia_dir = project_dir.join(".aurelia");
    let log_path = aurelia_dir.join("events.jsonl");
    if !log_path.exists() {
        return Ok(None);
    }

    let primary_metric = RuntimeConfig::load(&aurelia_dir)
        .ok()
        .and_then(|c| c.termination().ok().flatten())
        .map(|c| c.metric);

    let log = EventLog::open(&log_path).context("open event log")?;
    let events = log.scan().context("scan event log")?;
    Ok(Some(StateStore::replay(primary_metric, &events).snapshot()))
}

fn print_snapshot(snapshot: &RuntimeSnapshot) {
    let status = if snapshot.stopped {
        "stopped"
    } else if snapshot.shutting_down {
        "stopping"
    } else {
        "running"
    };
    let (succeeded, failed, aborted) = snapshot.candidates.values().fold(
        (0usize, 0usize, 0usize),
        |(s, f, a), c| match c.state {
            CandidateState::Succeeded => (s + 1, f, a),
            CandidateState::Failed => (s, f + 1, a),
            CandidateState::Aborted => (s, f, a + 1),
            _ => (s, f, a),
        },
    );

    println!("Status          : {status}");
    println!("Candidates      : {}", snapshot.candidates.len());
    println!("  active        : {}", snapshot.active.len());
    println!("  succeeded     : {succeeded}");
    println!("  failed        : {failed}");
    println!("  aborted       : {aborted}");
    match snapshot.best_candidate() {
        Some(best) => println!("Best so far     : candidate {}", best.id),
        None => println!("Best so far     : -"),
    }
    println!("Events applied  : {}", snapshot.last_seq);
}
