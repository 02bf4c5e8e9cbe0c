/// The interactive session: notify bar on the terminal, live configuration
/// and appointment reloads, and the hand-over to the daemon on exit.
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock;
use crate::config::{self, Config, DaemonSettings, NotificationConfig, NotifyBarConfig};
use crate::daemon::{self, StartOutcome, StopOutcome};
use crate::display::{BarDisplay, TerminalBar};
use crate::event::AppEvent;
use crate::notifier::Notifier;
use crate::paths::Paths;
use crate::record::lock;
use crate::refresh::RefreshController;
use crate::resolver::AppointmentStore;
use crate::spawn::{ProcessSpawner, Spawner};
use crate::store::{Appointment, Appointments, FileStore};

pub async fn run(paths: Paths) -> Result<()> {
    // Never let a daemon alert alongside the bar.
    if let StopOutcome::Signalled(pid) = daemon::stop(&paths.lock_file())? {
        info!("Stopped background daemon (pid {pid})");
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths.config_file();
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!("Config error (using defaults): {e:#}");
        Config::default()
    });
    let mut daemon_settings = DaemonSettings::from(initial_config.daemon);

    // ── Appointments ──────────────────────────────────────────────────────────
    let appointments_path = paths.appointments_file();
    let store = Arc::new(FileStore::open(appointments_path.clone())?);
    let mut known = store.snapshot();

    let spawner: Arc<dyn Spawner> = Arc::new(ProcessSpawner::reaping());
    let notifier = Notifier::new(
        NotifyBarConfig::from_config(&initial_config.notification),
        store.clone(),
        spawner.clone(),
    );
    let source = store
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let display: Arc<dyn BarDisplay> = Arc::new(TerminalBar::stdout(source));

    let mut refresh = RefreshController::default();
    if notifier.is_bar_enabled() {
        refresh.start(&notifier, display.clone()).await;
    }

    let (event_tx, mut event_rx) = mpsc::channel::<AppEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_files(
        config_path,
        appointments_path,
        event_tx.clone(),
    ));

    // Leave on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(AppEvent::Shutdown).await;
            }
        });
    }

    info!("agenda-notify v{} started", env!("CARGO_PKG_VERSION"));

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            AppEvent::ConfigReloaded(new_config) => {
                apply_notification_config(&notifier, &mut refresh, &display, &new_config.notification).await;
                daemon_settings = DaemonSettings::from(new_config.daemon);
                info!("Config reloaded");
            }

            AppEvent::AppointmentsChanged => {
                if let Err(e) = store.reload() {
                    warn!("Failed to reload appointments: {e:#}");
                    continue;
                }
                let current = store.snapshot();
                apply_appointment_changes(&notifier, &known, &current, clock::now_secs());
                known = current;
            }

            AppEvent::Shutdown => {
                refresh.stop().await;
                // Leave the bar line intact above the prompt.
                println!();
                break;
            }
        }
    }

    if daemon_settings.enabled {
        if let StartOutcome::AlreadyRunning(pid) = daemon::start(&paths, spawner.as_ref())? {
            warn!("Daemon not started: pid {pid} holds the lock file");
        }
    }
    Ok(())
}

/// Applies a reloaded `[notification]` section. Turning the bar on starts the
/// refresh loop; turning it off stops the loop and empties the record. A
/// policy change alone forces a lookup.
pub async fn apply_notification_config(
    notifier: &Notifier,
    refresh: &mut RefreshController,
    display: &Arc<dyn BarDisplay>,
    cfg: &NotificationConfig,
) {
    let changes = lock(notifier.bar()).apply(cfg);
    if changes.enabled {
        if notifier.is_bar_enabled() {
            refresh.start(notifier, display.clone()).await;
        } else {
            refresh.stop().await;
            lock(notifier.record()).clear();
        }
    } else if changes.policy {
        notifier.check_next_app(true);
    }
}

/// Routes the difference between two appointment sets through the insert
/// rules. Returns the forced lookup started when the held item disappeared.
pub fn apply_appointment_changes(
    notifier: &Notifier,
    previous: &Appointments,
    current: &Appointments,
    now: i64,
) -> Option<JoinHandle<bool>> {
    let added = current.added_since(previous);
    for apt in &added.single {
        if let Some(c) = apt.candidate() {
            notifier.check_added_at(now, &c.text, c.occurs_at, c.flags);
        }
    }
    for series in &added.recurring {
        notifier.check_repeated_at(now, series);
    }

    let removed = previous.added_since(current);
    let today = clock::local_date(now);
    let held_removed = removed
        .single
        .iter()
        .filter_map(Appointment::candidate)
        .chain(removed.recurring.iter().filter_map(|r| r.candidate_after(now, today)))
        .any(|c| notifier.same_item(c.occurs_at));
    if held_removed {
        notifier.check_next_app(true)
    } else {
        None
    }
}
