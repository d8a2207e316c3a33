//! Correlation between Interception device indices and OS device handles.
//!
//! The Interception driver numbers devices by slot, while device discovery
//! and filtering work on Raw Input handles. Nothing links the two, so the
//! table is filled lazily: the first stroke seen from a slot looks up the
//! slot's hardware ids and matches them against the ids recorded for every
//! known handle.

use crate::registry::DeviceRegistry;
use std::collections::HashMap;
use std::hash::Hash;

/// Parse the `(vid, pid, rev)` triplet of an id of the form
/// `HID\VID_xxxx&PID_xxxx&REV_xxxx...`.
pub fn parse_vid_pid_rev(id: &str) -> Option<(u32, u32, u32)> {
    fn hex(input: &str) -> Option<(u32, &str)> {
        let end = input
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(input.len());
        let value = u32::from_str_radix(&input[..end], 16).ok()?;
        Some((value, &input[end..]))
    }

    let rest = id.strip_prefix("HID\\VID_")?;
    let (vid, rest) = hex(rest)?;
    let (pid, rest) = hex(rest.strip_prefix("&PID_")?)?;
    let (rev, _) = hex(rest.strip_prefix("&REV_")?)?;
    Some((vid, pid, rev))
}

fn entries(list: &str) -> impl Iterator<Item = &str> {
    list.split('\0').filter(|entry| !entry.is_empty())
}

/// Whether two NUL-separated hardware id lists describe the same device.
///
/// Only entries of `list_a` containing a backslash are considered. They
/// match an entry of `list_b` that is identical or that carries the same
/// vid/pid/rev triplet.
pub fn match_hardware_ids(list_a: &str, list_b: &str) -> bool {
    entries(list_a)
        .filter(|a| a.contains('\\'))
        .any(|a| {
            let triplet = parse_vid_pid_rev(a);
            entries(list_b).any(|b| a == b || (triplet.is_some() && triplet == parse_vid_pid_rev(b)))
        })
}

/// Lazily populated, bidirectional slot/handle map.
#[derive(Debug)]
pub struct CorrelationTable<H> {
    known: Vec<(H, String)>,
    handle_by_device: HashMap<i32, H>,
    device_by_handle: HashMap<H, i32>,
}

impl<H> Default for CorrelationTable<H> {
    fn default() -> Self {
        Self {
            known: Vec::new(),
            handle_by_device: HashMap::new(),
            device_by_handle: HashMap::new(),
        }
    }
}

impl<H: Copy + Eq + Hash> CorrelationTable<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hardware ids of a discovered device.
    pub fn add_device(&mut self, handle: H, hardware_ids: String) {
        self.known.retain(|(known, _)| *known != handle);
        self.known.push((handle, hardware_ids));
    }

    /// Forget a removed device and its cached slot.
    pub fn remove_device(&mut self, handle: H) {
        self.known.retain(|(known, _)| *known != handle);
        if let Some(device) = self.device_by_handle.remove(&handle) {
            self.handle_by_device.remove(&device);
        }
    }

    /// Handle of the device in slot `device`.
    ///
    /// `hardware_ids` is only called on a cache miss.
    pub fn resolve(&mut self, device: i32, hardware_ids: impl FnOnce() -> String) -> Option<H> {
        if let Some(handle) = self.handle_by_device.get(&device) {
            return Some(*handle);
        }
        let ids = hardware_ids();
        let handle = self
            .known
            .iter()
            .find(|(_, known)| match_hardware_ids(known, &ids))
            .map(|(handle, _)| *handle)?;
        self.handle_by_device.insert(device, handle);
        self.device_by_handle.insert(handle, device);
        Some(handle)
    }

    /// Whether strokes from slot `device` belong to a live device.
    ///
    /// Slots that correlate with no known device are never captured.
    pub fn is_captured(
        &mut self,
        registry: &DeviceRegistry<H>,
        device: i32,
        hardware_ids: impl FnOnce() -> String,
    ) -> bool {
        self.resolve(device, hardware_ids)
            .is_some_and(|handle| registry.is_live(&handle))
    }

    /// Cached slot of a handle, if a stroke from it was seen.
    pub fn device_of(&self, handle: H) -> Option<i32> {
        self.device_by_handle.get(&handle).copied()
    }

    /// Whether a slot is currently correlated.
    pub fn is_resolved(&self, device: i32) -> bool {
        self.handle_by_device.contains_key(&device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const KEYBOARD_1: &str = "HID\\VID_046D&PID_C31C&REV_6400&MI_00\0HID\\VID_046D&PID_C31C&MI_00\0HID_DEVICE_SYSTEM_KEYBOARD\0";
    const KEYBOARD_2: &str = "HID\\VID_05AC&PID_024F&REV_0111\0HID\\VID_05AC&PID_024F\0";

    #[test]
    fn test_parse_vid_pid_rev() {
        assert_eq!(
            parse_vid_pid_rev("HID\\VID_046D&PID_C31C&REV_6400&MI_00"),
            Some((0x046D, 0xC31C, 0x6400))
        );
        assert_eq!(parse_vid_pid_rev("HID\\VID_046D&PID_C31C"), None);
        assert_eq!(parse_vid_pid_rev("USB\\VID_046D&PID_C31C&REV_6400"), None);
    }

    #[test]
    fn test_match_exact_entry() {
        assert!(match_hardware_ids(
            KEYBOARD_1,
            "HID\\VID_046D&PID_C31C&MI_00\0"
        ));
        assert!(!match_hardware_ids(KEYBOARD_1, KEYBOARD_2));
    }

    #[test]
    fn test_match_by_triplet() {
        // same device, different interface suffix
        assert!(match_hardware_ids(
            "HID\\VID_05AC&PID_024F&REV_0111&Col01\0",
            KEYBOARD_2
        ));
    }

    #[test]
    fn test_entries_without_backslash_ignored() {
        assert!(!match_hardware_ids(
            "HID_DEVICE_SYSTEM_KEYBOARD\0",
            "HID_DEVICE_SYSTEM_KEYBOARD\0"
        ));
    }

    #[test]
    fn test_resolution_is_lazy_and_cached() {
        let mut table = CorrelationTable::new();
        table.add_device(1usize, KEYBOARD_1.to_string());
        table.add_device(2usize, KEYBOARD_2.to_string());

        let lookups = Cell::new(0);
        let ids = || {
            lookups.set(lookups.get() + 1);
            KEYBOARD_2.to_string()
        };
        assert_eq!(table.resolve(3, ids), Some(2));
        assert_eq!(table.resolve(3, ids), Some(2));
        assert_eq!(lookups.get(), 1);
        assert_eq!(table.device_of(2), Some(3));
        assert_eq!(table.device_of(1), None);
    }

    #[test]
    fn test_removal_invalidates_slot() {
        let mut table = CorrelationTable::new();
        table.add_device(7usize, KEYBOARD_1.to_string());
        assert_eq!(table.resolve(1, || KEYBOARD_1.to_string()), Some(7));

        table.remove_device(7);
        assert!(!table.is_resolved(1));
        assert_eq!(table.resolve(1, || KEYBOARD_1.to_string()), None);
    }

    #[test]
    fn test_strokes_of_ignored_devices_are_not_captured() {
        use crate::filter::{FilterField, FilterPattern, GrabFilter, GrabFilters, GrabPolicy};
        use crate::registry::DeviceDescriptor;

        let mut registry = DeviceRegistry::new(GrabFilters::with_default(GrabPolicy::Grab));
        registry.attach(DeviceDescriptor::new("Logitech Keyboard", "kbd-1", 10isize));
        registry.attach(DeviceDescriptor::new("Apple Keyboard", "kbd-2", 20isize));
        let mut table = CorrelationTable::new();
        table.add_device(10isize, KEYBOARD_1.to_string());
        table.add_device(20isize, KEYBOARD_2.to_string());

        assert!(table.is_captured(&registry, 1, || KEYBOARD_1.to_string()));
        assert!(table.is_captured(&registry, 2, || KEYBOARD_2.to_string()));
        // a slot that matches nothing known goes back to the system
        assert!(!table.is_captured(&registry, 5, || {
            "HID\\VID_FFFF&PID_0001\0".to_string()
        }));

        // the filter update turns the Apple keyboard into an ignored device
        registry.set_grab_filters(GrabFilters::with_default(GrabPolicy::Grab).rule(
            GrabFilter::ignore(FilterField::Name, FilterPattern::Contains("Apple".into())),
        ));
        assert!(table.is_captured(&registry, 1, || unreachable!()));
        assert!(!table.is_captured(&registry, 2, || unreachable!()));
    }
}
