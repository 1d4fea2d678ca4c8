//! Daemon configuration.

use std::path::PathBuf;

/// Default socket path the daemon listens on and clients connect to.
pub const DEFAULT_DEVICE: &str = "/dev/watchcat";

/// Environment variable overriding the device path.
pub const DEVICE_ENV: &str = "WATCHCATD_DEVICE";

/// Runtime configuration for the watchcat daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Socket path clients connect to.
    pub device: PathBuf,
    /// Optional pidfile held under an exclusive lock while running.
    pub pid_file: Option<PathBuf>,
    /// Suppress operational logs on stderr.
    pub quiet: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            pid_file: None,
            quiet: false,
        }
    }
}

/// Device path from the environment override, or the built-in default.
pub fn default_device() -> PathBuf {
    std::env::var_os(DEVICE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE))
}
