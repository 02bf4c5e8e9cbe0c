/// One-shot alert command for the held appointment.
use tracing::{error, info};

use crate::config::NotifyBarConfig;
use crate::record::NotificationRecord;
use crate::spawn::{DetachedCommand, Spawner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The command was started with this process id.
    Launched(u32),
    /// The command already fired for the held appointment; nothing was spawned.
    AlreadyNotified,
    /// Process creation failed. The fired bit stays set, so no retry follows.
    Failed,
}

/// Runs the configured command through the configured shell, at most once per
/// held appointment. Must be called with the record locked so the fired bit
/// flips atomically with the decision to launch.
pub fn launch(
    record: &mut NotificationRecord,
    bar: &NotifyBarConfig,
    spawner: &dyn Spawner,
) -> LaunchOutcome {
    if !record.mark_notified() {
        return LaunchOutcome::AlreadyNotified;
    }

    match spawner.spawn_detached(&DetachedCommand::shell(&bar.shell, &bar.command)) {
        Ok(pid) => {
            let text = record.held().map_or("", |h| h.text.as_str());
            info!("Launch notification: {text:?} (pid {pid})");
            LaunchOutcome::Launched(pid)
        }
        Err(e) => {
            error!("Error while launching notification command {:?}: {e}", bar.command);
            LaunchOutcome::Failed
        }
    }
}
