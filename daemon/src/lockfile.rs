/// The daemon lock file: one decimal process id, present while a daemon runs.
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The file now holds our pid.
    Written,
    /// Another live process already holds the lock.
    HeldBy(i32),
}

/// Publishes the current pid at `path`. The pid is written to a private file
/// first and hard-linked into place, so the lock never exists half-written.
/// A lock left behind by a dead process is removed and the link retried once;
/// a lock held by a live process is left alone. A lock whose content is not a
/// pid may belong to a daemon that has not finished starting, so it is an
/// error rather than a takeover.
pub fn acquire(path: &Path) -> Result<Acquired> {
    let own = std::process::id();
    let staged = StagedPid::write(path, own)?;

    for attempt in 0..2 {
        match std::fs::hard_link(staged.path(), path) {
            Ok(()) => return Ok(Acquired::Written),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock file {}", path.display()))
            }
        }

        let Some(pid) = read_pid(path) else {
            bail!(
                "Lock file {} exists but holds no pid; remove it if no daemon is starting",
                path.display()
            );
        };
        if u32::try_from(pid).is_ok_and(|p| p != own) && is_alive(pid) {
            return Ok(Acquired::HeldBy(pid));
        }
        if attempt == 0 {
            warn!("Removing stale lock file {} (pid {pid})", path.display());
            match remove(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove stale lock file {}", path.display()))
                }
            }
        }
    }
    bail!("Lock file {} keeps reappearing with a dead pid", path.display())
}

/// Our pid in a sibling of the lock file, removed on drop.
struct StagedPid {
    path: PathBuf,
}

impl StagedPid {
    fn write(lock_path: &Path, pid: u32) -> Result<Self> {
        let mut name = lock_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{pid}.tmp"));
        let path = lock_path.with_file_name(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        write!(file, "{pid}").with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedPid {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The pid stored in `path`, if the file exists and holds a positive number.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

/// The pid in `path` if that process is still alive.
pub fn running_pid(path: &Path) -> Option<i32> {
    read_pid(path).filter(|pid| is_alive(*pid))
}

pub fn remove(path: &Path) -> io::Result<()> {
    std::fs::remove_file(path)
}

pub fn is_alive(pid: i32) -> bool {
    let Ok(raw) = u32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_u32(raw);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}
