//! macOS backend: IOHIDManager seizes and the Karabiner virtual HID
//! keyboard.
//!
//! ## Requirements
//!
//! - Karabiner-DriverKit-VirtualHIDDevice installed and activated
//! - root, or Input Monitoring access for seizing keyboards

mod seize;
mod vhid_client;

pub use seize::SeizedKeyboards;
pub use vhid_client::VirtualHidKeyboard;

use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::filter::GrabFilters;

/// Grabbed devices of this platform.
pub type Devices = SeizedKeyboards;

/// Virtual output of this platform.
pub type Output = VirtualHidKeyboard;

/// Connect the virtual keyboard, then seize the keyboards the filters
/// select.
pub fn open_devices(identity: &DeviceIdentity, filters: GrabFilters) -> Result<(Devices, Output)> {
    let output = VirtualHidKeyboard::create(identity)?;
    let devices = SeizedKeyboards::open(identity, filters)?;
    Ok((devices, output))
}
