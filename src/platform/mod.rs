//! Platform-specific device backends.
//!
//! Exactly one backend is compiled. Each exports `Devices`, `Output` and
//! `open_devices`.

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use self::macos::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

// no backend for this target
#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
compile_error!("remapd only supports macOS, Windows, and Linux");
