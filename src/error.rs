//! Error types for the remapping daemon.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for remapd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while grabbing, translating or re-emitting input.
#[derive(Debug, Error)]
pub enum Error {
    /// The control endpoint could not be created or opened.
    #[error("cannot open control endpoint {path}: {source}")]
    Endpoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required driver or kernel facility is missing.
    #[error("{0}")]
    DriverUnavailable(String),

    /// The virtual HID driver reported an incompatible version.
    #[error("virtual HID driver version mismatch: {0}")]
    DriverVersionMismatch(String),

    /// No physical device matched the grab filters.
    #[error("no eligible input device found: {0}")]
    NoDevices(String),

    /// A device is exclusively owned by another process.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// The operation requires elevated permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Reading from a grabbed device failed mid-session.
    #[error("failed to read device event: {0}")]
    DeviceRead(String),

    /// The virtual output device could not be created.
    #[error("failed to create virtual device: {0}")]
    VirtualDevice(String),

    /// Posting an event to the virtual output device failed.
    #[error("failed to send event: {0}")]
    SendFailed(String),

    /// The IPC client sent a malformed frame.
    #[error("malformed message: {0}")]
    Protocol(String),

    /// The client configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Thread-related error.
    #[error("thread error: {0}")]
    ThreadError(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must abort the daemon instead of ending the session.
    ///
    /// Missing endpoint, drivers, devices or permissions and a failed
    /// virtual device creation are fatal. Everything else is recovered by
    /// tearing the session down and accepting a new client.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Endpoint { .. }
                | Error::DriverUnavailable(_)
                | Error::DriverVersionMismatch(_)
                | Error::NoDevices(_)
                | Error::DeviceBusy(_)
                | Error::PermissionDenied(_)
                | Error::VirtualDevice(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::NoDevices("none".into()).is_fatal());
        assert!(Error::DriverUnavailable("install".into()).is_fatal());
        assert!(Error::DeviceBusy("grabbed elsewhere".into()).is_fatal());
        assert!(!Error::ThreadError("spawn".into()).is_fatal());
        assert!(!Error::DeviceRead("gone".into()).is_fatal());
        assert!(!Error::Protocol("bad".into()).is_fatal());
    }
}
