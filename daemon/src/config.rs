use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::clock;
use crate::event::AppEvent;
use crate::record::{AppointmentFlags, DAY_SECS};

pub const DEFAULT_DATE_FORMAT: &str = "%a %F";
pub const DEFAULT_TIME_FORMAT: &str = "%T";
pub const DEFAULT_WARNING_SECS: i64 = 300;
pub const DEFAULT_COMMAND: &str = "printf '\\a'";
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Which appointments qualify for the alert command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    All,
    #[default]
    FlaggedOnly,
    UnflaggedOnly,
}

impl NotifyPolicy {
    pub fn is_eligible(self, flags: AppointmentFlags) -> bool {
        let flagged = flags.contains(AppointmentFlags::NOTIFY);
        match self {
            NotifyPolicy::All => true,
            NotifyPolicy::FlaggedOnly => flagged,
            NotifyPolicy::UnflaggedOnly => !flagged,
        }
    }
}

/// Root configuration structure. Deserialized from `<data dir>/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// `[notification]` as written on disk; validated into [`NotifyBarConfig`].
#[derive(Debug, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub notifybar: bool,
    #[serde(default = "default_date_format")]
    pub notifydate: String,
    #[serde(default = "default_time_format")]
    pub notifytime: String,
    #[serde(default = "default_warning")]
    pub warning: i64,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub notifyall: NotifyPolicy,
    /// Shell used to run `command`. Falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notifybar: true,
            notifydate: DEFAULT_DATE_FORMAT.to_string(),
            notifytime: DEFAULT_TIME_FORMAT.to_string(),
            warning: DEFAULT_WARNING_SECS,
            command: DEFAULT_COMMAND.to_string(),
            notifyall: NotifyPolicy::default(),
            shell: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub log: bool,
}

/// Runtime notify-bar settings, shared between the config watcher, the
/// refresh loop and lookup tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyBarConfig {
    pub enabled: bool,
    pub warning_secs: i64,
    pub date_format: String,
    pub time_format: String,
    pub command: String,
    pub shell: String,
    pub policy: NotifyPolicy,
}

pub type SharedBarConfig = Arc<Mutex<NotifyBarConfig>>;

/// What changed in the last [`NotifyBarConfig::apply`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BarChanges {
    pub enabled: bool,
    pub policy: bool,
}

impl Default for NotifyBarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_secs: DEFAULT_WARNING_SECS,
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            time_format: DEFAULT_TIME_FORMAT.to_string(),
            command: DEFAULT_COMMAND.to_string(),
            shell: default_shell(),
            policy: NotifyPolicy::default(),
        }
    }
}

impl NotifyBarConfig {
    pub fn from_config(cfg: &NotificationConfig) -> Self {
        let mut bar = Self::default();
        bar.apply(cfg);
        bar
    }

    pub fn shared(self) -> SharedBarConfig {
        Arc::new(Mutex::new(self))
    }

    /// Copies validated values from `cfg`. Invalid values are discarded and
    /// the previous value is kept.
    pub fn apply(&mut self, cfg: &NotificationConfig) -> BarChanges {
        let changes = BarChanges {
            enabled: self.enabled != cfg.notifybar,
            policy: self.policy != cfg.notifyall,
        };
        self.enabled = cfg.notifybar;
        self.policy = cfg.notifyall;

        if (0..=DAY_SECS).contains(&cfg.warning) {
            self.warning_secs = cfg.warning;
        } else {
            warn!("Ignoring notification.warning = {}: must be 0..={DAY_SECS}", cfg.warning);
        }

        if clock::is_valid_format(&cfg.notifydate) {
            self.date_format = cfg.notifydate.clone();
        } else {
            warn!("Ignoring invalid notification.notifydate {:?}", cfg.notifydate);
        }
        if clock::is_valid_format(&cfg.notifytime) {
            self.time_format = cfg.notifytime.clone();
        } else {
            warn!("Ignoring invalid notification.notifytime {:?}", cfg.notifytime);
        }

        self.command = cfg.command.clone();
        self.shell = cfg.shell.clone().unwrap_or_else(default_shell);
        changes
    }

    /// The alert command is disabled when empty or commented out with `#`.
    pub fn command_enabled(&self) -> bool {
        let cmd = self.command.trim_start();
        !cmd.is_empty() && !cmd.starts_with('#')
    }
}

/// Daemon toggles. Only touched from one thread of control at a time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSettings {
    pub enabled: bool,
    pub logging_enabled: bool,
}

impl From<DaemonConfig> for DaemonSettings {
    fn from(cfg: DaemonConfig) -> Self {
        Self {
            enabled: cfg.enable,
            logging_enabled: cfg.log,
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Watches the parent directories of `config_path` and `appointments_path`.
/// A write to the config file reloads it and sends `ConfigReloaded`; a write
/// to the appointment file sends `AppointmentsChanged`.
pub async fn watch_files(
    config_path: PathBuf,
    appointments_path: PathBuf,
    tx: mpsc::Sender<AppEvent>,
) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directories rather than the files directly so we catch
    // editor-style atomic saves (write-new + rename).
    let dirs: BTreeSet<PathBuf> = [&config_path, &appointments_path]
        .iter()
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .collect();
    for dir in &dirs {
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            error!("Failed to watch {}: {e}", dir.display());
            return;
        }
    }

    while let Some(event) = watch_rx.recv().await {
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );
        if !is_write {
            continue;
        }

        if event.paths.iter().any(|p| p == &config_path) {
            match load_or_default(&config_path) {
                Ok(config) => {
                    if tx.send(AppEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to reload config: {e:#}"),
            }
        }
        if event.paths.iter().any(|p| p == &appointments_path)
            && tx.send(AppEvent::AppointmentsChanged).await.is_err()
        {
            break;
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

fn default_true() -> bool {
    true
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

fn default_warning() -> i64 {
    DEFAULT_WARNING_SECS
}

fn default_command() -> String {
    DEFAULT_COMMAND.to_string()
}
