//! Daemon settings.

use crate::device::DeviceIdentity;
use std::path::PathBuf;

/// Default control endpoint.
#[cfg(unix)]
pub const DEFAULT_IPC_PATH: &str = "/tmp/remapd";

/// Default control endpoint.
#[cfg(windows)]
pub const DEFAULT_IPC_PATH: &str = r"\\.\pipe\remapd";

/// Runtime settings of the daemon process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Where the control endpoint is created.
    pub ipc_path: PathBuf,
    /// Enable diagnostic output.
    pub verbose: bool,
    /// Identity of the virtual output device.
    pub identity: DeviceIdentity,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ipc_path: PathBuf::from(DEFAULT_IPC_PATH),
            verbose: false,
            identity: DeviceIdentity::default(),
        }
    }
}

impl Settings {
    /// Override the endpoint path.
    pub fn with_ipc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ipc_path = path.into();
        self
    }

    /// Set the verbose flag.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ipc_path, PathBuf::from(DEFAULT_IPC_PATH));
        assert!(!settings.verbose);
        assert_eq!(settings.identity.name, "remapd");
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::default()
            .with_ipc_path("/run/remapd.sock")
            .with_verbose(true);
        assert_eq!(settings.ipc_path, PathBuf::from("/run/remapd.sock"));
        assert!(settings.verbose);
    }
}
