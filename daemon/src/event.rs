use crate::config::Config;

pub enum AppEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The appointment file changed on disk.
    AppointmentsChanged,
    /// Ctrl+C received; stop the refresh loop and hand over to the daemon.
    Shutdown,
}
