mod alert;
mod clock;
mod config;
mod daemon;
mod display;
mod event;
mod lockfile;
mod logging;
mod notifier;
mod paths;
mod record;
mod refresh;
mod resolver;
mod session;
mod spawn;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use crate::daemon::{DaemonStatus, StartOutcome, StopOutcome};
use crate::paths::Paths;
use crate::spawn::ProcessSpawner;

#[derive(Parser, Debug)]
#[command(
    name = "agenda-notify",
    version,
    about = "Appointment countdown bar and background reminder daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory holding config.toml, appointments.toml and the lock file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the notify bar in this terminal (default)
    Bar,
    /// Start the background daemon
    Start,
    /// Stop the background daemon
    Stop,
    /// Make the background daemon re-read its data
    Reload,
    /// Report whether the background daemon is running
    Status,
    #[command(name = daemon::RUN_DETACHED_COMMAND, hide = true)]
    RunDetached,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match Paths::resolve(cli.data_dir.as_deref()) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Bar);
    if let Commands::RunDetached = command {
        // Logs to the daemon log, if at all.
        return daemon::run_detached(&paths);
    }

    if let Err(e) = logging::init_stderr(&cli.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(command, paths) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Commands, paths: Paths) -> Result<()> {
    match command {
        Commands::Bar => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build runtime")?;
            runtime.block_on(session::run(paths))
        }
        Commands::Start => {
            match daemon::start(&paths, &ProcessSpawner::non_reaping())? {
                StartOutcome::Started(pid) => println!("Daemon started (pid {pid})"),
                StartOutcome::AlreadyRunning(pid) => println!("Daemon already running (pid {pid})"),
            }
            Ok(())
        }
        Commands::Stop => {
            report_delivery("stop", daemon::stop(&paths.lock_file())?);
            Ok(())
        }
        Commands::Reload => {
            report_delivery("reload", daemon::reload(&paths.lock_file())?);
            Ok(())
        }
        Commands::Status => {
            match daemon::status(&paths.lock_file()) {
                DaemonStatus::Running(pid) => println!("Daemon is running (pid {pid})"),
                DaemonStatus::Stale(pid) => {
                    println!("Daemon is not running (stale lock file for pid {pid})")
                }
                DaemonStatus::NotRunning => println!("Daemon is not running"),
            }
            Ok(())
        }
        Commands::RunDetached => unreachable!("handled before logging is set up"),
    }
}

fn report_delivery(request: &str, outcome: StopOutcome) {
    match outcome {
        StopOutcome::Signalled(pid) => println!("Sent {request} request to daemon (pid {pid})"),
        StopOutcome::AlreadyGone(pid) => println!("Daemon (pid {pid}) is already gone"),
        StopOutcome::NotRunning => println!("Daemon is not running"),
    }
}
