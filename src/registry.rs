//! Device descriptor registry.
//!
//! Keeps every known physical device in exactly one of two lists: *live*
//! (matches the current filters and is to be grabbed) or *ignored*. Every
//! mutation runs the same two phases: [`reset`](DeviceRegistry::reset) merges
//! the ignored devices back, the change is applied, and
//! [`apply`](DeviceRegistry::apply) re-partitions the whole set. A full
//! re-scan keeps the partition exact across any order of attach, detach and
//! filter changes.

use crate::filter::GrabFilters;

/// Identity of one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor<H> {
    /// Display name.
    pub name: String,
    /// Stable hardware id.
    pub id: String,
    /// OS handle.
    pub handle: H,
}

impl<H> DeviceDescriptor<H> {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, id: impl Into<String>, handle: H) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            handle,
        }
    }
}

/// What has to happen to a device for its grab to match the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabChange {
    /// Live but not grabbed yet.
    Grab,
    /// Grabbed but ignored by the current filters.
    Release,
}

/// Live/ignored partition of the known devices.
#[derive(Debug, Clone)]
pub struct DeviceRegistry<H> {
    filters: GrabFilters,
    live: Vec<DeviceDescriptor<H>>,
    ignored: Vec<DeviceDescriptor<H>>,
}

impl<H: PartialEq + Clone> DeviceRegistry<H> {
    /// Create an empty registry with the given filters.
    pub fn new(filters: GrabFilters) -> Self {
        Self {
            filters,
            live: Vec::new(),
            ignored: Vec::new(),
        }
    }

    /// Current filters.
    pub fn filters(&self) -> &GrabFilters {
        &self.filters
    }

    /// Devices that match the filters.
    pub fn live(&self) -> &[DeviceDescriptor<H>] {
        &self.live
    }

    /// Devices that do not match the filters.
    pub fn ignored(&self) -> &[DeviceDescriptor<H>] {
        &self.ignored
    }

    /// Whether the device with this handle is live.
    pub fn is_live(&self, handle: &H) -> bool {
        self.live.iter().any(|d| &d.handle == handle)
    }

    /// How the grab state `grabbed` of a device has to change, if at all.
    ///
    /// Unknown devices are treated as ignored.
    pub fn grab_change(&self, handle: &H, grabbed: bool) -> Option<GrabChange> {
        match (self.is_live(handle), grabbed) {
            (true, false) => Some(GrabChange::Grab),
            (false, true) => Some(GrabChange::Release),
            _ => None,
        }
    }

    /// Whether the device with this handle is known at all.
    pub fn contains(&self, handle: &H) -> bool {
        self.find(handle).is_some()
    }

    /// Look up a descriptor in either list.
    pub fn find(&self, handle: &H) -> Option<&DeviceDescriptor<H>> {
        self.live
            .iter()
            .chain(self.ignored.iter())
            .find(|d| &d.handle == handle)
    }

    /// Register a hot-plugged device.
    ///
    /// A device that is already known is replaced.
    pub fn attach(&mut self, descriptor: DeviceDescriptor<H>) {
        self.reset();
        self.live.retain(|d| d.handle != descriptor.handle);
        log::debug!("device '{}' ({}) attached", descriptor.name, descriptor.id);
        self.live.push(descriptor);
        self.apply();
    }

    /// Remove a device, returning its descriptor when it was known.
    pub fn detach(&mut self, handle: &H) -> Option<DeviceDescriptor<H>> {
        self.reset();
        let removed = self
            .live
            .iter()
            .position(|d| &d.handle == handle)
            .map(|index| self.live.remove(index));
        if let Some(descriptor) = &removed {
            log::debug!("device '{}' ({}) detached", descriptor.name, descriptor.id);
        }
        self.apply();
        removed
    }

    /// Replace the filter set and re-partition.
    pub fn set_grab_filters(&mut self, filters: GrabFilters) {
        self.reset();
        self.filters = filters;
        self.apply();
    }

    /// Merge every ignored device back into the live list.
    pub fn reset(&mut self) {
        self.live.append(&mut self.ignored);
    }

    /// Move every live device that the filters reject to the ignored list.
    pub fn apply(&mut self) {
        let filters = &self.filters;
        let (live, ignored): (Vec<_>, Vec<_>) = std::mem::take(&mut self.live)
            .into_iter()
            .partition(|d| filters.should_grab(&d.name, &d.id));
        self.live = live;
        self.ignored.extend(ignored);
    }
}
