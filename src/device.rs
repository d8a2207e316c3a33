//! Capability interface shared by every platform backend.
//!
//! Exactly one backend is compiled per target (see `platform`), so these
//! traits are used as generic bounds and never as trait objects. Tests
//! substitute in-memory implementations.

use crate::error::Result;
use crate::event::{InputEvent, KeyEvent, RawEvent};
use crate::filter::GrabFilters;
use std::time::Duration;

/// How long a device read blocks before giving control back to the loop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed identity advertised by the virtual output device.
///
/// Grab backends use it to recognize, and never grab, the device this
/// process creates itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device name.
    pub name: String,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
}

impl DeviceIdentity {
    /// Whether a device with these properties is our own virtual device.
    pub fn matches(&self, name: &str, vendor_id: u16, product_id: u16) -> bool {
        name == self.name && vendor_id == self.vendor_id && product_id == self.product_id
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            name: "remapd".into(),
            vendor_id: 0x1209,
            product_id: 0x5245,
        }
    }
}

/// The set of physical devices exclusively owned by one session.
pub trait GrabbedDevices {
    /// Wait up to `timeout` for the next raw event.
    ///
    /// Returns `Ok(None)` when the timeout elapsed. An error means the
    /// grab was lost and the session has to end.
    fn read_event(&mut self, timeout: Duration) -> Result<Option<InputEvent>>;

    /// Replace the filters and re-grab or release devices to match.
    fn set_grab_filters(&mut self, filters: GrabFilters) -> Result<()>;
}

/// An OS-level emulated input device.
///
/// Implementations release the device when dropped.
pub trait VirtualOutput {
    /// Post a key transition. Never called with the OutputOnRelease sentinel.
    fn send_key_event(&mut self, event: &KeyEvent) -> Result<()>;

    /// Forward an event the remap layer does not interpret.
    fn send_event(&mut self, event: &RawEvent) -> Result<()>;

    /// Commit buffered reports.
    fn flush(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory devices for loop and daemon tests.

    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Something the mock output received.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Emitted {
        Key(KeyEvent),
        Raw(RawEvent),
        Flush,
    }

    /// Scripted input source. Runs dry with a read error unless `idle_forever`.
    #[derive(Default)]
    pub struct ScriptedDevices {
        pub events: VecDeque<InputEvent>,
        pub filters: Arc<Mutex<Vec<GrabFilters>>>,
        pub idle_forever: bool,
        pub released: Option<Arc<Mutex<bool>>>,
    }

    impl ScriptedDevices {
        /// Devices that play `events`, then fail the next read.
        pub fn scripted(events: Vec<InputEvent>) -> Self {
            Self {
                events: events.into(),
                filters: Arc::default(),
                idle_forever: false,
                released: None,
            }
        }

        /// Devices that play `events`, then idle without failing.
        pub fn idle(events: Vec<InputEvent>) -> Self {
            let mut devices = Self::scripted(events);
            devices.idle_forever = true;
            devices
        }
    }

    impl GrabbedDevices for ScriptedDevices {
        fn read_event(&mut self, _timeout: Duration) -> Result<Option<InputEvent>> {
            match self.events.pop_front() {
                Some(event) => Ok(Some(event)),
                None if self.idle_forever => {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(None)
                }
                None => Err(Error::DeviceRead("script exhausted".into())),
            }
        }

        fn set_grab_filters(&mut self, filters: GrabFilters) -> Result<()> {
            self.filters.lock().unwrap().push(filters);
            Ok(())
        }
    }

    impl Drop for ScriptedDevices {
        fn drop(&mut self) {
            if let Some(flag) = &self.released {
                *flag.lock().unwrap() = true;
            }
        }
    }

    /// Output that records everything it is sent.
    #[derive(Default, Clone)]
    pub struct RecordingOutput {
        pub emitted: Arc<Mutex<Vec<Emitted>>>,
    }

    impl RecordingOutput {
        pub fn keys(&self) -> Vec<KeyEvent> {
            self.emitted
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    Emitted::Key(k) => Some(*k),
                    _ => None,
                })
                .collect()
        }
    }

    impl VirtualOutput for RecordingOutput {
        fn send_key_event(&mut self, event: &KeyEvent) -> Result<()> {
            assert!(!event.is_output_on_release());
            self.emitted.lock().unwrap().push(Emitted::Key(*event));
            Ok(())
        }

        fn send_event(&mut self, event: &RawEvent) -> Result<()> {
            self.emitted.lock().unwrap().push(Emitted::Raw(*event));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.emitted.lock().unwrap().push(Emitted::Flush);
            Ok(())
        }
    }
}
