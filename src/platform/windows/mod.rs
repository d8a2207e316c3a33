//! Windows backend built on the Interception driver.
//!
//! The driver and `interception.dll` must be installed; the same context
//! captures strokes and injects the translated ones.

mod grab;
mod interception;
mod output;
mod raw_input;

use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::filter::GrabFilters;
use interception::Interception;
use std::sync::Arc;

pub use grab::InterceptionDevices;
pub use output::InterceptionOutput;

/// Grabbed devices of this platform.
pub type Devices = InterceptionDevices;

/// Virtual output of this platform.
pub type Output = InterceptionOutput;

/// Load the driver, then start capturing the devices the filters select.
pub fn open_devices(_identity: &DeviceIdentity, filters: GrabFilters) -> Result<(Devices, Output)> {
    let interception = Arc::new(Interception::load()?);
    let last = Arc::new(grab::LastDevices::default());
    let output = Output::new(Arc::clone(&interception), Arc::clone(&last));
    let devices = Devices::open(interception, last, filters)?;
    Ok((devices, output))
}
