/// Launching processes that outlive, or run independently of, the caller.
///
/// Used to start the background daemon and to run the alert command. The
/// child never shares stdio with the parent.
use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::unistd::setsid;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Start the child in a new session, detached from the controlling
    /// terminal.
    pub new_session: bool,
    pub working_dir: Option<PathBuf>,
}

impl DetachedCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            new_session: false,
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn new_session(mut self) -> Self {
        self.new_session = true;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// `<shell> -c <script>`.
    pub fn shell(shell: &str, script: &str) -> Self {
        Self::new(shell).arg("-c").arg(script)
    }
}

pub trait Spawner: Send + Sync {
    /// Starts `cmd` without waiting for it and returns its process id.
    fn spawn_detached(&self, cmd: &DetachedCommand) -> io::Result<u32>;
}

/// Spawns real OS processes.
pub struct ProcessSpawner {
    /// Wait for children on a helper thread. Not needed once SIGCHLD is
    /// ignored, since the kernel then reaps them.
    reap_children: bool,
}

impl ProcessSpawner {
    pub fn reaping() -> Self {
        Self { reap_children: true }
    }

    pub fn non_reaping() -> Self {
        Self { reap_children: false }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn_detached(&self, cmd: &DetachedCommand) -> io::Result<u32> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &cmd.working_dir {
            command.current_dir(dir);
        }
        if cmd.new_session {
            // SAFETY: setsid is async-signal-safe and touches no parent state.
            unsafe {
                command.pre_exec(|| setsid().map(drop).map_err(io::Error::from));
            }
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!("Spawned {} (pid {pid})", cmd.program.display());

        if self.reap_children {
            std::thread::Builder::new()
                .name("child-reaper".into())
                .spawn(move || {
                    let _ = child.wait();
                })?;
        }
        Ok(pid)
    }
}
