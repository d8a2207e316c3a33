//! Exclusive keyboard access through IOHIDManager.
//!
//! A dedicated thread owns the HID manager and its run loop. Keyboards are
//! opened with `kIOHIDOptionsTypeSeizeDevice` so their input reaches only
//! this process; matching and removal callbacks keep the registry current.

#![allow(unsafe_op_in_unsafe_fn)]

use crate::device::{DeviceIdentity, GrabbedDevices};
use crate::error::{Error, Result};
use crate::event::{InputEvent, KeyEvent, KeyState, RawEvent};
use crate::filter::GrabFilters;
use crate::keycode::Key;
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::vhid::{PAGE_KEYBOARD, USAGE_KEYBOARD_A, USAGE_KEYBOARD_RIGHT_GUI};
use objc2_core_foundation::{
    CFNumber, CFNumberType, CFRunLoop, CFString, CFType, kCFRunLoopDefaultMode,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type IOReturn = i32;
type IOHIDManagerRef = *mut c_void;
type IOHIDDeviceRef = *mut c_void;
type IOHIDValueRef = *mut c_void;
type IOHIDElementRef = *mut c_void;

type DeviceCallback = unsafe extern "C" fn(
    context: *mut c_void,
    result: IOReturn,
    sender: *mut c_void,
    device: IOHIDDeviceRef,
);
type ValueCallback = unsafe extern "C" fn(
    context: *mut c_void,
    result: IOReturn,
    sender: *mut c_void,
    value: IOHIDValueRef,
);

const IO_RETURN_SUCCESS: IOReturn = 0;
const IO_RETURN_EXCLUSIVE_ACCESS: IOReturn = 0xE00002C5_u32 as i32;
const IO_RETURN_NOT_PERMITTED: IOReturn = 0xE00002E2_u32 as i32;
const IO_RETURN_NOT_PRIVILEGED: IOReturn = 0xE00002C1_u32 as i32;

const OPTIONS_NONE: u32 = 0;
const OPTIONS_SEIZE_DEVICE: u32 = 1;

/// Product name prefix of the virtual HID service's own devices.
const VIRTUAL_DEVICE_PREFIX: &str = "Karabiner DriverKit";

const PAGE_GENERIC_DESKTOP: u32 = 0x01;
const USAGE_KEYBOARD: u32 = 0x06;

#[link(name = "IOKit", kind = "framework")]
unsafe extern "C" {
    fn IOHIDManagerCreate(allocator: *const c_void, options: u32) -> IOHIDManagerRef;
    fn IOHIDManagerSetDeviceMatching(manager: IOHIDManagerRef, matching: *const c_void);
    fn IOHIDManagerRegisterDeviceMatchingCallback(
        manager: IOHIDManagerRef,
        callback: Option<DeviceCallback>,
        context: *mut c_void,
    );
    fn IOHIDManagerRegisterDeviceRemovalCallback(
        manager: IOHIDManagerRef,
        callback: Option<DeviceCallback>,
        context: *mut c_void,
    );
    fn IOHIDManagerScheduleWithRunLoop(
        manager: IOHIDManagerRef,
        run_loop: *const c_void,
        mode: *const c_void,
    );
    fn IOHIDManagerUnscheduleFromRunLoop(
        manager: IOHIDManagerRef,
        run_loop: *const c_void,
        mode: *const c_void,
    );
    fn IOHIDDeviceConformsTo(device: IOHIDDeviceRef, page: u32, usage: u32) -> u8;
    fn IOHIDDeviceGetProperty(device: IOHIDDeviceRef, key: *const c_void) -> *const c_void;
    fn IOHIDDeviceOpen(device: IOHIDDeviceRef, options: u32) -> IOReturn;
    fn IOHIDDeviceClose(device: IOHIDDeviceRef, options: u32) -> IOReturn;
    fn IOHIDDeviceRegisterInputValueCallback(
        device: IOHIDDeviceRef,
        callback: Option<ValueCallback>,
        context: *mut c_void,
    );
    fn IOHIDDeviceScheduleWithRunLoop(
        device: IOHIDDeviceRef,
        run_loop: *const c_void,
        mode: *const c_void,
    );
    fn IOHIDDeviceUnscheduleFromRunLoop(
        device: IOHIDDeviceRef,
        run_loop: *const c_void,
        mode: *const c_void,
    );
    fn IOHIDValueGetElement(value: IOHIDValueRef) -> IOHIDElementRef;
    fn IOHIDValueGetIntegerValue(value: IOHIDValueRef) -> isize;
    fn IOHIDElementGetUsagePage(element: IOHIDElementRef) -> u32;
    fn IOHIDElementGetUsage(element: IOHIDElementRef) -> u32;
}

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    fn CFRelease(cf: *const c_void);
}

/// Translate one HID input value.
///
/// Keyboard usages `a..=right GUI` become key events; other keyboard-page
/// values (reserved, error rollover) are dropped; everything else is
/// passed through as `(page, usage, value)`.
fn input_event(page: u32, usage: u32, value: isize) -> InputEvent {
    let (Ok(page), Ok(usage)) = (u16::try_from(page), u16::try_from(usage)) else {
        return InputEvent::Sync;
    };
    if page == PAGE_KEYBOARD {
        if !(USAGE_KEYBOARD_A..=USAGE_KEYBOARD_RIGHT_GUI).contains(&usage) {
            return InputEvent::Sync;
        }
        let state = if value != 0 {
            KeyState::Down
        } else {
            KeyState::Up
        };
        return InputEvent::key(KeyEvent::new(Key(usage), state));
    }
    InputEvent::Passthrough(RawEvent::new(page, usage, value as i32))
}

fn open_error(name: &str, result: IOReturn) -> Error {
    match result {
        IO_RETURN_EXCLUSIVE_ACCESS => Error::DeviceBusy(format!("{name} is seized by another process")),
        IO_RETURN_NOT_PERMITTED | IO_RETURN_NOT_PRIVILEGED => Error::PermissionDenied(format!(
            "cannot seize {name}. Grant Input Monitoring access or run as root."
        )),
        other => Error::DeviceRead(format!("cannot seize {name}: IOReturn {other:#x}")),
    }
}

/// Run loop and mode a device is scheduled on.
#[derive(Clone, Copy)]
struct Schedule {
    run_loop: *const c_void,
    mode: *const c_void,
}

struct SeizedDevice {
    device: IOHIDDeviceRef,
    name: String,
    seized: bool,
}

/// State owned by the manager thread and handed to IOKit callbacks.
struct SeizeState {
    identity: DeviceIdentity,
    registry: DeviceRegistry<usize>,
    devices: Vec<SeizedDevice>,
    events: Sender<Result<InputEvent>>,
    schedule: Schedule,
}

unsafe fn int_property(device: IOHIDDeviceRef, key: &str) -> Option<i64> {
    let key = CFString::from_str(key);
    let value = IOHIDDeviceGetProperty(device, &*key as *const CFString as *const c_void);
    let value = (value as *const CFType).as_ref()?;
    let number = value.downcast_ref::<CFNumber>()?;
    let mut out: i64 = 0;
    number
        .value(CFNumberType::SInt64Type, &mut out as *mut _ as *mut _)
        .then_some(out)
}

unsafe fn string_property(device: IOHIDDeviceRef, key: &str) -> Option<String> {
    let key = CFString::from_str(key);
    let value = IOHIDDeviceGetProperty(device, &*key as *const CFString as *const c_void);
    let value = (value as *const CFType).as_ref()?;
    Some(value.downcast_ref::<CFString>()?.to_string())
}

impl SeizeState {
    unsafe fn attach(&mut self, device: IOHIDDeviceRef) {
        if IOHIDDeviceConformsTo(device, PAGE_GENERIC_DESKTOP, USAGE_KEYBOARD) == 0 {
            return;
        }
        let name = string_property(device, "Product").unwrap_or_else(|| "unknown".into());
        let vendor_id = int_property(device, "VendorID").unwrap_or(0) as u16;
        let product_id = int_property(device, "ProductID").unwrap_or(0) as u16;
        if name.starts_with(VIRTUAL_DEVICE_PREFIX)
            || self.identity.matches(&name, vendor_id, product_id)
        {
            return;
        }
        let handle = device as usize;
        if self.registry.contains(&handle) {
            return;
        }
        log::debug!("attached '{name}'");
        self.registry.attach(DeviceDescriptor::new(
            name.clone(),
            format!("{vendor_id:04x}:{product_id:04x}"),
            handle,
        ));
        self.devices.push(SeizedDevice {
            device,
            name,
            seized: false,
        });
    }

    unsafe fn detach(&mut self, device: IOHIDDeviceRef) {
        let handle = device as usize;
        if self.registry.detach(&handle).is_none() {
            return;
        }
        let was_seized = self
            .devices
            .iter()
            .any(|d| d.device == device && d.seized);
        self.devices.retain(|d| d.device != device);
        log::debug!("detached device {handle:#x}");
        if was_seized && !self.devices.iter().any(|d| d.seized) {
            let _ = self
                .events
                .send(Err(Error::DeviceRead("all seized keyboards are gone".into())));
        }
    }

    /// Seize live keyboards and release ignored ones.
    unsafe fn sync_seizes(&mut self) -> Result<()> {
        let context = self as *mut SeizeState as *mut c_void;
        let Schedule { run_loop, mode } = self.schedule;
        for open in &mut self.devices {
            let live = self.registry.is_live(&(open.device as usize));
            if live && !open.seized {
                let result = IOHIDDeviceOpen(open.device, OPTIONS_SEIZE_DEVICE);
                if result != IO_RETURN_SUCCESS {
                    return Err(open_error(&open.name, result));
                }
                IOHIDDeviceRegisterInputValueCallback(open.device, Some(on_value), context);
                IOHIDDeviceScheduleWithRunLoop(open.device, run_loop, mode);
                open.seized = true;
                log::debug!("seized '{}'", open.name);
            } else if !live && open.seized {
                release(open, self.schedule);
                log::debug!("released '{}'", open.name);
            }
        }
        Ok(())
    }

    unsafe fn release_all(&mut self) {
        let schedule = self.schedule;
        for open in self.devices.iter_mut().filter(|d| d.seized) {
            release(open, schedule);
        }
    }
}

unsafe fn release(open: &mut SeizedDevice, schedule: Schedule) {
    IOHIDDeviceRegisterInputValueCallback(open.device, None, std::ptr::null_mut());
    IOHIDDeviceUnscheduleFromRunLoop(open.device, schedule.run_loop, schedule.mode);
    IOHIDDeviceClose(open.device, OPTIONS_SEIZE_DEVICE);
    open.seized = false;
}

unsafe extern "C" fn on_matched(
    context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    device: IOHIDDeviceRef,
) {
    let state = &mut *(context as *mut SeizeState);
    state.attach(device);
    // hotplugged keyboards are seized as they arrive
    if let Err(e) = state.sync_seizes() {
        log::warn!("{e}");
    }
}

unsafe extern "C" fn on_removed(
    context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    device: IOHIDDeviceRef,
) {
    let state = &mut *(context as *mut SeizeState);
    state.detach(device);
}

unsafe extern "C" fn on_value(
    context: *mut c_void,
    _result: IOReturn,
    _sender: *mut c_void,
    value: IOHIDValueRef,
) {
    let state = &*(context as *const SeizeState);
    let element = IOHIDValueGetElement(value);
    if element.is_null() {
        return;
    }
    let event = input_event(
        IOHIDElementGetUsagePage(element),
        IOHIDElementGetUsage(element),
        IOHIDValueGetIntegerValue(value),
    );
    if event != InputEvent::Sync {
        let _ = state.events.send(Ok(event));
    }
}

struct ManagerThread {
    identity: DeviceIdentity,
    filters: GrabFilters,
    events: Sender<Result<InputEvent>>,
    updates: Receiver<GrabFilters>,
    shutdown: Arc<AtomicBool>,
}

impl ManagerThread {
    fn run(self, started: SyncSender<Result<()>>) {
        let Some(run_loop) = CFRunLoop::current() else {
            let _ = started.send(Err(Error::ThreadError("no run loop".into())));
            return;
        };
        let mode = unsafe { kCFRunLoopDefaultMode };
        let schedule = Schedule {
            run_loop: &*run_loop as *const CFRunLoop as *const c_void,
            mode: mode.map_or(std::ptr::null(), |m| m as *const _ as *const c_void),
        };

        let state = Box::into_raw(Box::new(SeizeState {
            identity: self.identity,
            registry: DeviceRegistry::new(self.filters),
            devices: Vec::new(),
            events: self.events,
            schedule,
        }));
        let context = state as *mut c_void;

        unsafe {
            let manager = IOHIDManagerCreate(std::ptr::null(), OPTIONS_NONE);
            if manager.is_null() {
                drop(Box::from_raw(state));
                let _ = started.send(Err(Error::DriverUnavailable(
                    "cannot create IOHIDManager".into(),
                )));
                return;
            }
            IOHIDManagerSetDeviceMatching(manager, std::ptr::null());
            IOHIDManagerRegisterDeviceMatchingCallback(manager, Some(on_matched), context);
            IOHIDManagerRegisterDeviceRemovalCallback(manager, Some(on_removed), context);
            IOHIDManagerScheduleWithRunLoop(manager, schedule.run_loop, schedule.mode);

            // deliver the initial matches
            let _ = CFRunLoop::run_in_mode(mode, 0.1, false);
            let startup = if (*state).devices.is_empty() {
                Err(Error::NoDevices("no keyboard found".into()))
            } else {
                (*state).sync_seizes()
            };
            let failed = startup.is_err();
            let _ = started.send(startup);

            if !failed {
                while !self.shutdown.load(Ordering::Acquire) {
                    while let Ok(filters) = self.updates.try_recv() {
                        (*state).registry.set_grab_filters(filters);
                        if let Err(e) = (*state).sync_seizes() {
                            let _ = (*state).events.send(Err(e));
                        }
                    }
                    let _ = CFRunLoop::run_in_mode(mode, 0.1, false);
                }
            }

            (*state).release_all();
            IOHIDManagerRegisterDeviceMatchingCallback(manager, None, std::ptr::null_mut());
            IOHIDManagerRegisterDeviceRemovalCallback(manager, None, std::ptr::null_mut());
            IOHIDManagerUnscheduleFromRunLoop(manager, schedule.run_loop, schedule.mode);
            CFRelease(manager);
            drop(Box::from_raw(state));
        }
    }
}

/// Keyboards seized through IOHIDManager.
pub struct SeizedKeyboards {
    events: Receiver<Result<InputEvent>>,
    updates: Sender<GrabFilters>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SeizedKeyboards {
    /// Start the manager thread and seize the keyboards the filters select.
    pub fn open(identity: &DeviceIdentity, filters: GrabFilters) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel();
        let (update_tx, update_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let shutdown = Arc::new(AtomicBool::new(false));

        let manager = ManagerThread {
            identity: identity.clone(),
            filters,
            events: event_tx,
            updates: update_rx,
            shutdown: Arc::clone(&shutdown),
        };
        let thread = thread::Builder::new()
            .name("hid-manager".into())
            .spawn(move || manager.run(started_tx))
            .map_err(|e| Error::ThreadError(format!("Failed to spawn HID manager thread: {e}")))?;

        let mut keyboards = Self {
            events: event_rx,
            updates: update_tx,
            shutdown,
            thread: Some(thread),
        };
        let started = started_rx
            .recv()
            .map_err(|_| Error::ThreadError("HID manager thread exited".into()))?;
        if let Err(e) = started {
            keyboards.stop();
            return Err(e);
        }
        Ok(keyboards)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl GrabbedDevices for SeizedKeyboards {
    fn read_event(&mut self, timeout: Duration) -> Result<Option<InputEvent>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => event.map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::DeviceRead("HID manager thread stopped".into()))
            }
        }
    }

    fn set_grab_filters(&mut self, filters: GrabFilters) -> Result<()> {
        self.updates
            .send(filters)
            .map_err(|_| Error::DeviceRead("HID manager thread stopped".into()))
    }
}

impl Drop for SeizedKeyboards {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyboard_usages_become_keys() {
        assert_eq!(
            input_event(0x07, 0x04, 1),
            InputEvent::key(KeyEvent::down(Key(0x04)))
        );
        assert_eq!(
            input_event(0x07, 0xE1, 0),
            InputEvent::key(KeyEvent::up(Key(0xE1)))
        );
    }

    #[test]
    fn test_reserved_keyboard_usages_are_dropped() {
        assert_eq!(input_event(0x07, 0x01, 1), InputEvent::Sync);
        assert_eq!(input_event(0x07, 0xFFFF_FFFF, 1), InputEvent::Sync);
    }

    #[test]
    fn test_other_pages_pass_through() {
        assert_eq!(
            input_event(0xFF, 0x03, 1),
            InputEvent::Passthrough(RawEvent::new(0xFF, 0x03, 1))
        );
    }

    #[test]
    fn test_open_errors() {
        assert!(matches!(
            open_error("kbd", IO_RETURN_EXCLUSIVE_ACCESS),
            Error::DeviceBusy(_)
        ));
        assert!(matches!(
            open_error("kbd", IO_RETURN_NOT_PERMITTED),
            Error::PermissionDenied(_)
        ));
    }
}
