//! Dynamically loaded Interception driver API.
//!
//! `interception.dll` is looked up at runtime so the daemon starts (and
//! explains what is missing) on systems without the driver.

use crate::error::{Error, Result};
use crate::stroke::Stroke;
use std::ffi::c_void;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows::core::{PCSTR, s};

type Context = *mut c_void;
type Predicate = unsafe extern "C" fn(device: i32) -> i32;

type CreateContext = unsafe extern "C" fn() -> Context;
type DestroyContext = unsafe extern "C" fn(context: Context);
type SetFilter = unsafe extern "C" fn(context: Context, predicate: Predicate, filter: u16);
type WaitWithTimeout = unsafe extern "C" fn(context: Context, milliseconds: u32) -> i32;
type ReceiveStroke =
    unsafe extern "C" fn(context: Context, device: i32, stroke: *mut Stroke, count: u32) -> i32;
type SendStroke =
    unsafe extern "C" fn(context: Context, device: i32, stroke: *const Stroke, count: u32) -> i32;
type GetHardwareId =
    unsafe extern "C" fn(context: Context, device: i32, buffer: *mut c_void, size: u32) -> u32;

const NOT_INSTALLED: &str = "To use the Interception driver, install it and put \
    'interception.dll' next to remapd, then reboot.";

/// An open Interception context.
pub struct Interception {
    module: HMODULE,
    context: Context,
    destroy_context: DestroyContext,
    set_filter: SetFilter,
    is_keyboard: Predicate,
    is_mouse: Predicate,
    wait_with_timeout: WaitWithTimeout,
    receive: ReceiveStroke,
    send: SendStroke,
    get_hardware_id: GetHardwareId,
}

// The context is a handle table the driver API synchronizes itself.
unsafe impl Send for Interception {}
unsafe impl Sync for Interception {}

unsafe fn load<T>(module: HMODULE, name: PCSTR) -> Result<T> {
    let proc = unsafe { GetProcAddress(module, name) }
        .ok_or_else(|| Error::DriverUnavailable(NOT_INSTALLED.into()))?;
    // SAFETY: T is one of the function pointer types above
    Ok(unsafe { std::mem::transmute_copy(&proc) })
}

impl Interception {
    /// Load the library and create a context.
    pub fn load() -> Result<Self> {
        let module = unsafe { LoadLibraryA(s!("interception.dll")) }
            .map_err(|_| Error::DriverUnavailable(NOT_INSTALLED.into()))?;

        let loaded = unsafe { Self::resolve(module) };
        let interception = match loaded {
            Ok(interception) => interception,
            Err(e) => {
                unsafe {
                    let _ = FreeLibrary(module);
                }
                return Err(e);
            }
        };
        if interception.context.is_null() {
            // Drop frees the library
            return Err(Error::DriverUnavailable(
                "Initializing Interception driver failed. Did you install it and reboot?".into(),
            ));
        }
        Ok(interception)
    }

    unsafe fn resolve(module: HMODULE) -> Result<Self> {
        unsafe {
            let create_context: CreateContext = load(module, s!("interception_create_context"))?;
            let mut interception = Self {
                module,
                context: std::ptr::null_mut(),
                destroy_context: load(module, s!("interception_destroy_context"))?,
                set_filter: load(module, s!("interception_set_filter"))?,
                is_keyboard: load(module, s!("interception_is_keyboard"))?,
                is_mouse: load(module, s!("interception_is_mouse"))?,
                wait_with_timeout: load(module, s!("interception_wait_with_timeout"))?,
                receive: load(module, s!("interception_receive"))?,
                send: load(module, s!("interception_send"))?,
                get_hardware_id: load(module, s!("interception_get_hardware_id"))?,
            };
            interception.context = create_context();
            Ok(interception)
        }
    }

    /// Capture keyboard strokes matching `keyboard` and mouse strokes
    /// matching `mouse`.
    pub fn set_filters(&self, keyboard: u16, mouse: u16) {
        unsafe {
            (self.set_filter)(self.context, self.is_keyboard, keyboard);
            (self.set_filter)(self.context, self.is_mouse, mouse);
        }
    }

    /// Wait for a stroke; returns the device index, 0 on timeout.
    pub fn wait(&self, milliseconds: u32) -> i32 {
        unsafe { (self.wait_with_timeout)(self.context, milliseconds) }
    }

    /// Take the pending stroke of a device.
    pub fn receive(&self, device: i32) -> Option<Stroke> {
        let mut stroke = Stroke::default();
        let received = unsafe { (self.receive)(self.context, device, &mut stroke, 1) };
        (received > 0).then_some(stroke)
    }

    /// Send a stroke as if it came from `device`.
    pub fn send(&self, device: i32, stroke: &Stroke) -> bool {
        unsafe { (self.send)(self.context, device, stroke, 1) > 0 }
    }

    /// NUL-separated hardware ids of a device.
    pub fn hardware_ids(&self, device: i32) -> String {
        let mut buffer = vec![0u16; 256];
        let bytes = unsafe {
            (self.get_hardware_id)(
                self.context,
                device,
                buffer.as_mut_ptr().cast(),
                (buffer.len() * size_of::<u16>()) as u32,
            )
        };
        let len = (bytes as usize / size_of::<u16>()).min(buffer.len());
        String::from_utf16_lossy(&buffer[..len])
    }
}

impl Drop for Interception {
    fn drop(&mut self) {
        unsafe {
            if !self.context.is_null() {
                (self.destroy_context)(self.context);
            }
            let _ = FreeLibrary(self.module);
        }
    }
}
