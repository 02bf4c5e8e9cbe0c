/// Canonical file paths for agenda data files.
///
/// Everything lives in one data directory (`$XDG_DATA_HOME/agenda`, falling
/// back to `~/.local/share/agenda`, or `--data-dir`):
///   - config.toml        Notification and daemon settings.
///   - appointments.toml  The appointment store.
///   - daemon.pid         Lock file holding the daemon's process id.
///   - daemon.log         Daemon activity log, when enabled.
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

const APP_DIR_NAME: &str = "agenda";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const APPOINTMENTS_FILE_NAME: &str = "appointments.toml";
pub const LOCK_FILE_NAME: &str = "daemon.pid";
pub const DAEMON_LOG_FILE_NAME: &str = "daemon.log";

#[derive(Debug, Clone)]
pub struct Paths {
    dir: PathBuf,
}

impl Paths {
    /// Resolves the data directory, creates it if needed and makes it
    /// absolute so it survives the daemon's change to `/`.
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self> {
        let dir = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve data directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn appointments_file(&self) -> PathBuf {
        self.dir.join(APPOINTMENTS_FILE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.dir.join(DAEMON_LOG_FILE_NAME)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join(APP_DIR_NAME));
    }
    let home = std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("Neither XDG_DATA_HOME nor HOME is set"))?;
    Ok(PathBuf::from(home).join(".local").join("share").join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let paths = Paths::resolve(Some(&nested)).unwrap();
        assert!(nested.is_dir());
        assert!(paths.dir().is_absolute());
    }

    #[test]
    fn files_share_the_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::resolve(Some(dir.path())).unwrap();
        for file in [
            paths.config_file(),
            paths.appointments_file(),
            paths.lock_file(),
            paths.daemon_log(),
        ] {
            assert_eq!(file.parent(), Some(paths.dir()));
        }
        assert_eq!(paths.lock_file().file_name().unwrap(), LOCK_FILE_NAME);
    }
}
