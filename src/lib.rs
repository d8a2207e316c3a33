//! # remapd
//!
//! Core of a key-remapping daemon: exclusive device grabs, a virtual output
//! device and a translation loop whose remap configuration can be replaced
//! at runtime by a single IPC client.
//!
//! ## Features
//!
//! - Exclusive grabs on Linux (evdev), Windows (Interception) and macOS
//!   (IOHIDManager seize)
//! - Virtual output via uinput, Interception injection or the Karabiner
//!   virtual HID keyboard
//! - `OutputOnRelease` deferral and auto-repeat suppression
//! - Hot reload over a local socket or named pipe, applied only while no
//!   output key is held
//!
//! ## Quick Start
//!
//! ```no_run
//! use remapd::{Logger, MappingStage, Settings, daemon};
//! use std::sync::atomic::AtomicBool;
//!
//! let settings = Settings::default().with_verbose(true);
//! let shutdown = AtomicBool::new(false);
//! daemon::run::<MappingStage>(&settings, &shutdown, &Logger::new(settings.verbose))
//!     .expect("daemon failed");
//! ```
//!
//! A client then connects to [`Settings::ipc_path`] and sends a
//! [`Configuration`] with [`IpcClient`].
//!
//! ## Architecture
//!
//! Every platform backend implements [`GrabbedDevices`] and
//! [`VirtualOutput`]; exactly one backend is compiled per target and
//! plugged into the generic [`daemon`] cycle, so tests drive the same
//! loop with in-memory devices.

pub mod config;
pub mod correlate;
pub mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod filter;
pub mod ipc;
pub mod keycode;
pub mod logging;
pub mod registry;
pub mod stage;
pub mod stroke;
pub mod translate;
pub mod vhid;

mod platform;

// Re-exports
pub use config::Settings;
pub use device::{DeviceIdentity, GrabbedDevices, VirtualOutput};
pub use error::{Error, Result};
pub use event::{InputEvent, KeyEvent, KeySequence, KeyState, RawEvent};
pub use filter::{FilterField, FilterPattern, GrabFilter, GrabFilters, GrabPolicy};
pub use ipc::{Configuration, IpcClient, IpcServer};
pub use keycode::Key;
pub use logging::Logger;
pub use registry::{DeviceDescriptor, DeviceRegistry, GrabChange};
pub use stage::{Mapping, MappingConfig, MappingStage, Stage};
pub use translate::{SessionEnd, Translator};
