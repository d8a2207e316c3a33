//! Linux backend: evdev grabs and a uinput virtual device.
//!
//! ## Permissions
//!
//! Grabbing requires read access to `/dev/input/event*` and write access to
//! `/dev/uinput`:
//! ```bash
//! sudo usermod -aG input $USER
//! sudo modprobe uinput
//! # Then log out and back in
//! ```

mod grab;
mod uinput;

pub use grab::GrabbedKeyboards;
pub use uinput::UinputDevice;

use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::filter::GrabFilters;

/// Grabbed devices of this platform.
pub type Devices = GrabbedKeyboards;

/// Virtual output of this platform.
pub type Output = UinputDevice;

/// Create the virtual device, then grab the devices the filters select.
///
/// The virtual device exists first so the grab scan can recognize and skip
/// it.
pub fn open_devices(identity: &DeviceIdentity, filters: GrabFilters) -> Result<(Devices, Output)> {
    let output = UinputDevice::create(identity)?;
    let devices = GrabbedKeyboards::open(identity, filters)?;
    Ok((devices, output))
}
