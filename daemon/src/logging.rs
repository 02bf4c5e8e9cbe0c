use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const DAEMON_TIMESTAMP: &str = "%F %T";

/// Interactive session: human-readable logs on stderr. `RUST_LOG` wins over
/// `default_level` when set.
pub fn init_stderr(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("Invalid log level {default_level:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {e}"))
}

/// Daemon: single-line timestamped messages appended to `path`. With
/// `enabled == false` nothing is installed and every log macro is a no-op.
pub fn init_daemon_log(path: &Path, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open daemon log {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .with_writer(Mutex::new(file))
        .with_timer(ChronoLocal::new(DAEMON_TIMESTAMP.to_string()))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install daemon logger: {e}"))
}
