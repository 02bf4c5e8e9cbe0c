/// The background daemon: start and stop requests from the foreground, and
/// the detached, headless scheduling loop itself.
///
/// Starting re-executes the current binary as `run-detached` in a new session.
/// The child detaches fully, takes the lock file, then wakes on every minute
/// boundary to resolve the next appointment and fire the alert command.
/// Signals only enqueue [`Control`] messages; all cleanup happens in the loop.
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{dup2, getpid, getsid, setsid, Pid};
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::alert::LaunchOutcome;
use crate::clock;
use crate::config::{self, Config, DaemonSettings, NotifyBarConfig};
use crate::lockfile::{self, Acquired};
use crate::notifier::Notifier;
use crate::paths::Paths;
use crate::record::MINUTE_SECS;
use crate::resolver::AppointmentStore;
use crate::spawn::{DetachedCommand, ProcessSpawner, Spawner};
use crate::store::FileStore;

/// Hidden subcommand the detached child runs.
pub const RUN_DETACHED_COMMAND: &str = "run-detached";

const STD_FDS: [RawFd; 3] = [0, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A detached child was launched with this pid.
    Started(u32),
    /// The lock file names a live daemon; nothing was launched.
    AlreadyRunning(i32),
}

/// Result of delivering a control signal to the recorded daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No lock file, so nothing to signal.
    NotRunning,
    Signalled(i32),
    /// The recorded process no longer exists.
    AlreadyGone(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    NotRunning,
    Running(i32),
    /// A lock file is left behind by a process that is gone.
    Stale(i32),
}

/// Messages from the signal handlers to the scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Reload,
    Stop,
}

/// Launches the daemon unless one is already running. Returns as soon as the
/// child exists; its own failures only show in the daemon log and in the
/// absence of the lock file.
pub fn start(paths: &Paths, spawner: &dyn Spawner) -> Result<StartOutcome> {
    if let Some(pid) = lockfile::running_pid(&paths.lock_file()) {
        info!("Daemon already running (pid {pid})");
        return Ok(StartOutcome::AlreadyRunning(pid));
    }

    let exe = std::env::current_exe().context("Failed to locate the current executable")?;
    let cmd = DetachedCommand::new(exe)
        .arg("--data-dir")
        .arg(paths.dir())
        .arg(RUN_DETACHED_COMMAND)
        .new_session()
        .working_dir("/");
    let pid = spawner
        .spawn_detached(&cmd)
        .context("Could not start the daemon")?;
    info!("Daemon started (pid {pid})");
    Ok(StartOutcome::Started(pid))
}

/// Asks the recorded daemon to terminate.
pub fn stop(lock_path: &Path) -> Result<StopOutcome> {
    deliver(lock_path, Signal::SIGINT)
}

/// Asks the recorded daemon to re-read its data.
pub fn reload(lock_path: &Path) -> Result<StopOutcome> {
    deliver(lock_path, Signal::SIGUSR1)
}

pub fn status(lock_path: &Path) -> DaemonStatus {
    match lockfile::read_pid(lock_path) {
        None => DaemonStatus::NotRunning,
        Some(pid) if lockfile::is_alive(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
    }
}

fn deliver(lock_path: &Path, sig: Signal) -> Result<StopOutcome> {
    let Some(pid) = lockfile::read_pid(lock_path) else {
        return Ok(StopOutcome::NotRunning);
    };
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(StopOutcome::Signalled(pid)),
        Err(Errno::ESRCH) => Ok(StopOutcome::AlreadyGone(pid)),
        Err(e) => Err(e).with_context(|| format!("Could not signal daemon (pid {pid})")),
    }
}

/// Entry point of the detached child.
pub fn run_detached(paths: &Paths) -> ExitCode {
    let (config, config_error) = match config::load_or_default(&paths.config_file()) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    let settings = DaemonSettings::from(config.daemon);
    if let Err(e) = crate::logging::init_daemon_log(&paths.daemon_log(), settings.logging_enabled) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    if let Some(e) = config_error {
        warn!("Using default configuration: {e:#}");
    }

    if let Err(e) = detach() {
        error!("Cannot daemonize, aborting: {e:#}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(paths, &config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Leaves the controlling terminal and the caller's environment behind.
fn detach() -> Result<()> {
    // The spawner may already have made us a session leader.
    if getsid(None).context("Could not query session")? != getpid() {
        setsid().context("Could not detach from the controlling terminal")?;
    }
    std::env::set_current_dir("/").context("Could not change working directory")?;

    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Could not open /dev/null")?;
    for fd in STD_FDS {
        dup2(null.as_raw_fd(), fd).context("Could not redirect standard streams")?;
    }

    umask(Mode::S_IWGRP | Mode::S_IWOTH);

    // Alert commands are never waited on; let the kernel reap them.
    // SAFETY: SIG_IGN installs no handler code.
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }
        .context("Could not ignore SIGCHLD")?;
    Ok(())
}

fn install_signal_handlers(tx: mpsc::Sender<Control>) -> std::io::Result<()> {
    let kinds = [
        (SignalKind::interrupt(), Control::Stop),
        (SignalKind::terminate(), Control::Stop),
        (SignalKind::quit(), Control::Stop),
        (SignalKind::alarm(), Control::Stop),
        (SignalKind::user_defined1(), Control::Reload),
    ];
    for (kind, control) in kinds {
        let mut stream = tokio::signal::unix::signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(control).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

async fn serve(paths: &Paths, config: &Config) -> Result<()> {
    let (control_tx, control_rx) = mpsc::channel(8);
    install_signal_handlers(control_tx).context("Could not install signal handlers")?;

    let lock_path = paths.lock_file();
    if let Acquired::HeldBy(pid) = lockfile::acquire(&lock_path).context("Could not set lock file")? {
        bail!("Daemon already running (pid {pid})");
    }

    let store = match open_store(&paths.appointments_file()) {
        Ok(store) => store,
        Err(e) => {
            if let Err(rm) = lockfile::remove(&lock_path) {
                warn!("Could not remove daemon lock file: {rm}");
            }
            return Err(e);
        }
    };

    // Headless: the notify bar belongs to the interactive session.
    let mut bar = NotifyBarConfig::from_config(&config.notification);
    bar.enabled = false;
    let notifier = Notifier::new(bar, store.clone(), Arc::new(ProcessSpawner::non_reaping()));

    info!("Start");
    Scheduler::new(notifier, control_rx).run().await;
    shutdown(store.as_ref(), &lock_path)
}

fn open_store(path: &Path) -> Result<Arc<FileStore>> {
    let store = FileStore::open(path.to_path_buf())?;
    if !store.is_reachable() {
        bail!("Could not access {}", store.path().display());
    }
    Ok(Arc::new(store))
}

/// Releases the appointment data and removes the lock file. A lock file that
/// cannot be removed would block every later start, so that is an error.
fn shutdown(store: &dyn AppointmentStore, lock_path: &Path) -> Result<()> {
    store.release();
    lockfile::remove(lock_path)
        .with_context(|| format!("Could not remove daemon lock file {}", lock_path.display()))
}

/// Seconds until the next minute boundary; a full minute when already on one.
pub fn nap_secs(now: i64) -> i64 {
    match now % MINUTE_SECS {
        0 => MINUTE_SECS,
        rem => MINUTE_SECS - rem,
    }
}

/// The daemon's minute-aligned loop.
pub struct Scheduler {
    notifier: Notifier,
    control_rx: mpsc::Receiver<Control>,
    reload_pending: bool,
}

impl Scheduler {
    pub fn new(notifier: Notifier, control_rx: mpsc::Receiver<Control>) -> Self {
        Self {
            notifier,
            control_rx,
            reload_pending: false,
        }
    }

    /// One wake-up at `now`. Returns how long to sleep afterwards.
    pub fn iterate(&mut self, now: i64) -> i64 {
        info!("Awake");
        if std::mem::take(&mut self.reload_pending) {
            info!("Reloading");
            if let Err(e) = self.notifier.store().reload() {
                error!("Reload failed: {e:#}");
            }
        }

        self.notifier.refresh_now(now, false);
        if let Some(LaunchOutcome::Failed) = self.notifier.alert_if_due(now) {
            error!("Error while sending notification");
        }

        let nap = nap_secs(now);
        info!("Sleep {nap} seconds");
        nap
    }

    /// Runs until a stop request arrives or every signal sender is gone.
    pub async fn run(&mut self) {
        loop {
            let nap = self.iterate(clock::now_secs());
            let wake_at = Instant::now() + Duration::from_secs(nap.unsigned_abs());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake_at) => break,
                    control = self.control_rx.recv() => match control {
                        Some(Control::Reload) => {
                            info!("Reload signal");
                            self.reload_pending = true;
                        }
                        Some(Control::Stop) | None => {
                            info!("Stop signal");
                            return;
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyPolicy;
    use crate::record::{AppointmentFlags, Candidate};
    use crate::resolver::testing::FixedStore;
    use crate::spawn::testing::RecordingSpawner;

    fn headless(store: Arc<FixedStore>, spawner: Arc<RecordingSpawner>) -> Notifier {
        let bar = NotifyBarConfig {
            enabled: false,
            policy: NotifyPolicy::All,
            warning_secs: 300,
            ..NotifyBarConfig::default()
        };
        Notifier::new(bar, store, spawner)
    }

    fn paths_in(dir: &tempfile::TempDir) -> Paths {
        Paths::resolve(Some(dir.path())).unwrap()
    }

    // ── nap ───────────────────────────────────────────────────────────────────

    #[test]
    fn nap_wakes_on_the_minute() {
        assert_eq!(nap_secs(1_700_000_040), 60);
        assert_eq!(nap_secs(1_700_000_041), 59);
        assert_eq!(nap_secs(1_700_000_099), 1);
    }

    // ── scheduling loop ───────────────────────────────────────────────────────

    #[test]
    fn iteration_fires_alert_once_across_wakeups() {
        let now = clock::now_secs();
        let store = Arc::new(FixedStore::with(
            vec![Candidate {
                occurs_at: now + 100,
                flags: AppointmentFlags::empty(),
                text: "Call".to_string(),
            }],
            vec![],
        ));
        let spawner = Arc::new(RecordingSpawner::default());
        let (_tx, rx) = mpsc::channel(1);
        let mut scheduler = Scheduler::new(headless(store, spawner.clone()), rx);

        let nap = scheduler.iterate(now);
        assert!((1..=MINUTE_SECS).contains(&nap));
        assert_eq!(spawner.count(), 1);

        scheduler.iterate(now + 60);
        assert_eq!(spawner.count(), 1);
    }

    #[test]
    fn iteration_without_appointments_does_nothing() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (_tx, rx) = mpsc::channel(1);
        let mut scheduler = Scheduler::new(headless(Arc::new(FixedStore::default()), spawner.clone()), rx);
        scheduler.iterate(clock::now_secs());
        assert_eq!(spawner.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_signal_is_applied_on_next_wakeup() {
        let store = Arc::new(FixedStore::default());
        let (tx, rx) = mpsc::channel(8);
        let mut scheduler = Scheduler::new(headless(store.clone(), Arc::new(RecordingSpawner::default())), rx);
        let task = tokio::spawn(async move { scheduler.run().await });

        tx.send(Control::Reload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.reload_count(), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.reload_count(), 1);
        assert!(!task.is_finished());

        tx.send(Control::Stop).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_control_channel_ends_the_loop() {
        let (tx, rx) = mpsc::channel(1);
        let mut scheduler = Scheduler::new(
            headless(Arc::new(FixedStore::default()), Arc::new(RecordingSpawner::default())),
            rx,
        );
        drop(tx);
        scheduler.run().await;
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    #[test]
    fn shutdown_removes_lock_and_later_stop_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.pid");
        lockfile::acquire(&lock_path).unwrap();
        let store = FixedStore::default();

        shutdown(&store, &lock_path).unwrap();
        assert!(!lock_path.exists());
        assert_eq!(store.released.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stop(&lock_path).unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn shutdown_without_lock_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(shutdown(&FixedStore::default(), &dir.path().join("daemon.pid")).is_err());
    }

    #[test]
    fn missing_appointment_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_store(&dir.path().join("appointments.toml")).is_err());

        std::fs::write(dir.path().join("appointments.toml"), "").unwrap();
        assert!(open_store(&dir.path().join("appointments.toml")).is_ok());
    }

    // ── signals ───────────────────────────────────────────────────────────────

    // Signals reach every test in the process; only one test sends them at a time.
    static SIGNAL_TESTS: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    async fn next_control(rx: &mut mpsc::Receiver<Control>) -> Option<Control> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn signals_map_to_control_messages() {
        let _serial = SIGNAL_TESTS.lock().await;
        let (tx, mut rx) = mpsc::channel(8);
        install_signal_handlers(tx).unwrap();

        for (sig, expected) in [
            (Signal::SIGUSR1, Control::Reload),
            (Signal::SIGTERM, Control::Stop),
            (Signal::SIGINT, Control::Stop),
            (Signal::SIGQUIT, Control::Stop),
            (Signal::SIGALRM, Control::Stop),
        ] {
            kill(getpid(), sig).unwrap();
            assert_eq!(next_control(&mut rx).await, Some(expected), "{sig:?}");
        }
    }

    #[tokio::test]
    async fn terminate_signal_stops_the_loop_and_releases_the_lock() {
        let _serial = SIGNAL_TESTS.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.pid");
        assert_eq!(lockfile::acquire(&lock_path).unwrap(), Acquired::Written);

        let (tx, rx) = mpsc::channel(8);
        install_signal_handlers(tx).unwrap();
        let store = Arc::new(FixedStore::default());
        let mut scheduler = Scheduler::new(headless(store.clone(), Arc::new(RecordingSpawner::default())), rx);
        let task = tokio::spawn(async move { scheduler.run().await });

        kill(getpid(), Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop ended on SIGTERM")
            .unwrap();

        shutdown(store.as_ref(), &lock_path).unwrap();
        assert!(!lock_path.exists());
        assert_eq!(store.released.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stop(&lock_path).unwrap(), StopOutcome::NotRunning);
    }

    // ── control path ──────────────────────────────────────────────────────────

    #[test]
    fn stop_signals_live_daemon() {
        use std::os::unix::process::ExitStatusExt;

        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.pid");
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&lock_path, child.id().to_string()).unwrap();

        assert_eq!(stop(&lock_path).unwrap(), StopOutcome::Signalled(child.id() as i32));
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGINT as i32));
    }

    #[test]
    fn stop_of_vanished_daemon_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("daemon.pid");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();
        std::fs::write(&lock_path, pid.to_string()).unwrap();

        assert_eq!(stop(&lock_path).unwrap(), StopOutcome::AlreadyGone(pid));
        assert_eq!(status(&lock_path), DaemonStatus::Stale(pid));
    }

    #[test]
    fn reload_without_lock_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(reload(&dir.path().join("daemon.pid")).unwrap(), StopOutcome::NotRunning);
        assert_eq!(status(&dir.path().join("daemon.pid")), DaemonStatus::NotRunning);
    }

    #[test]
    fn start_is_a_no_op_while_daemon_alive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        let own = std::process::id() as i32;
        std::fs::write(paths.lock_file(), own.to_string()).unwrap();
        let spawner = RecordingSpawner::default();

        assert_eq!(start(&paths, &spawner).unwrap(), StartOutcome::AlreadyRunning(own));
        assert_eq!(spawner.count(), 0);
        assert_eq!(status(&paths.lock_file()), DaemonStatus::Running(own));
    }

    #[test]
    fn start_reexecutes_detached_child() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        let spawner = RecordingSpawner::default();

        assert!(matches!(start(&paths, &spawner).unwrap(), StartOutcome::Started(_)));
        let cmd = spawner.last().unwrap();
        assert!(cmd.new_session);
        assert_eq!(cmd.working_dir.as_deref(), Some(Path::new("/")));
        assert_eq!(cmd.args.last().and_then(|a| a.to_str()), Some(RUN_DETACHED_COMMAND));
        assert!(cmd.args.iter().any(|a| a == paths.dir().as_os_str()));
    }

    #[test]
    fn failed_start_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(start(&paths_in(&dir), &RecordingSpawner::failing()).is_err());
    }
}
