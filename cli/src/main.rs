//! fibril CLI - payload execution and process maintenance.
//!
//! ```text
//! dispatcher (library) --spawn--> fibril execute-payload <payload.json>
//!                                       |
//!                                       v
//!                           verify -> run job -> remove own PID record
//! ```
//!
//! The maintenance subcommands (`list-processes`, `kill-process`, `clean-stale`,
//! `optimize`) operate on the same state directory and are what a host scheduler
//! invokes (see `fibril schedule`).

mod crash_hardening;

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fibril_config::FibrilConfig;
use fibril_process::{JobRegistry, KillResult, Reaper, execute_payload, register_builtin};
use fibril_types::Pid;

#[derive(Parser)]
#[command(name = "fibril")]
#[command(about = "Run signed job payloads and maintain tracked child processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify and run a payload written by the dispatcher
    ExecutePayload {
        /// Payload file inside the payload directory
        payload: PathBuf,
    },
    /// List tracked processes and whether they are alive
    ListProcesses {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Kill a tracked process by PID
    KillProcess {
        /// Process ID to kill
        #[arg(allow_hyphen_values = true)]
        pid: String,
    },
    /// Remove PID records of processes that are no longer running
    CleanStale {
        /// Also remove payload files older than the payload TTL
        #[arg(long)]
        payloads: bool,
    },
    /// Remove stale PID records (payloads are left alone)
    Optimize,
    /// Print the maintenance tasks a scheduler should run
    Schedule,
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Children started with output capture write straight into a `.log` file.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(io::stderr().is_terminal()),
        )
        .with(env_filter)
        .init();
}

fn load_config() -> Result<FibrilConfig> {
    FibrilConfig::load().context("failed to load fibril configuration")
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::ExecutePayload { payload } => execute(&payload).await,
        Commands::ListProcesses { json } => list(json),
        Commands::KillProcess { pid } => kill(&pid).await,
        Commands::CleanStale { payloads } => clean(payloads),
        Commands::Optimize => {
            let removed = Reaper::from_config(&load_config()?).optimize()?;
            println!("Removed {removed} stale PID files.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => schedule(),
    }
}

async fn execute(payload: &Path) -> Result<ExitCode> {
    crash_hardening::apply()?;
    let config = load_config()?;
    let mut registry = JobRegistry::new();
    register_builtin(&mut registry);

    match execute_payload(&config, registry, payload).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("Failed to execute payload: {err}");
            Ok(ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1)))
        }
    }
}

fn list(as_json: bool) -> Result<ExitCode> {
    let reaper = Reaper::from_config(&load_config()?);
    let pid_dir = reaper.state_dirs().pids().dir().to_path_buf();
    let entries = reaper
        .list()
        .with_context(|| format!("failed to read {}", pid_dir.display()))?;

    if as_json {
        let rows: Vec<_> = entries
            .iter()
            .map(|entry| {
                let record = entry.record.as_ref();
                json!({
                    "pid": entry.pid.value(),
                    "status": entry.liveness.as_str(),
                    "label": record.and_then(|r| r.label.as_deref()),
                    "created_at": record.map(|r| r.created_at.to_rfc3339()),
                    "payload": record.map(|r| r.payload_path.display().to_string()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    if entries.is_empty() {
        println!("No tracked processes.");
        return Ok(ExitCode::SUCCESS);
    }

    for entry in &entries {
        let mut parts = vec![
            format!("PID: {}", entry.pid),
            format!("Status: {}", entry.liveness),
        ];
        if let Some(record) = &entry.record {
            if let Some(label) = &record.label {
                parts.push(format!("Label: {label}"));
            }
            parts.push(format!("Created: {}", record.created_at.to_rfc3339()));
            parts.push(format!("Payload: {}", record.payload_path.display()));
        }
        println!("{}", parts.join(" | "));
    }
    Ok(ExitCode::SUCCESS)
}

async fn kill(raw_pid: &str) -> Result<ExitCode> {
    let pid: Pid = match raw_pid.parse() {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("{err}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let reaper = Reaper::from_config(&load_config()?);
    match reaper.kill(pid).await {
        Ok(KillResult::Terminated { forced }) => {
            let how = if forced { "force-killed" } else { "terminated" };
            println!("Process {pid} {how}.");
            Ok(ExitCode::SUCCESS)
        }
        Ok(KillResult::AlreadyExited) => {
            println!("Process {pid} had already exited; record removed.");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn clean(payloads: bool) -> Result<ExitCode> {
    let reaper = Reaper::from_config(&load_config()?);
    let removed = reaper.clean_stale()?;
    println!("Removed {removed} stale PID files.");
    if payloads {
        let removed = reaper.clean_payloads()?;
        println!("Removed {removed} old payload files.");
    }
    Ok(ExitCode::SUCCESS)
}

fn schedule() -> Result<ExitCode> {
    let config = load_config()?;
    let tasks = config.schedule.maintenance_tasks()?;
    if tasks.is_empty() {
        println!("No maintenance tasks enabled.");
    }
    for task in tasks {
        println!(
            "{}\t{}\tfibril {}",
            task.name,
            task.frequency.cron_expression(),
            task.args.join(" ")
        );
    }
    Ok(ExitCode::SUCCESS)
}
