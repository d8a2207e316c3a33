//! Virtual keyboard and mouse via uinput.
//!
//! Events are collected until [`flush`](VirtualOutput::flush) and then
//! written as one batch, which evdev terminates with `SYN_REPORT`.

use crate::device::{DeviceIdentity, VirtualOutput};
use crate::error::{Error, Result};
use crate::event::{EV_KEY, EV_REL, KeyEvent, KeyState, RawEvent};
use crate::keycode::Key;
use evdev::{
    AttributeSet, BusType, EventType, InputEvent, InputId, Key as EvdevKey, RelativeAxisType,
    uinput::{VirtualDevice, VirtualDeviceBuilder},
};

/// Highest key code advertised by the device (`KEY_MAX`).
const KEY_MAX: u16 = 0x2FF;

const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;
const BTN_SIDE: u16 = 0x113;
const BTN_EXTRA: u16 = 0x114;

/// Native evdev event for a key code, `None` when the key has no output.
fn native_event(event: &KeyEvent) -> Option<RawEvent> {
    let pressed = event.state == KeyState::Down;
    let button = |code| Some(RawEvent::new(EV_KEY, code, i32::from(pressed)));
    match event.key {
        Key::NONE => None,
        Key::BUTTON_LEFT => button(BTN_LEFT),
        Key::BUTTON_RIGHT => button(BTN_RIGHT),
        Key::BUTTON_MIDDLE => button(BTN_MIDDLE),
        Key::BUTTON_BACK => button(BTN_SIDE),
        Key::BUTTON_FORWARD => button(BTN_EXTRA),
        key if key.is_wheel() => {
            // a wheel moves once per press
            if !pressed {
                return None;
            }
            let notches = i32::from(event.value.max(1));
            let (axis, value) = match key {
                Key::WHEEL_UP => (RelativeAxisType::REL_WHEEL, notches),
                Key::WHEEL_DOWN => (RelativeAxisType::REL_WHEEL, -notches),
                Key::WHEEL_LEFT => (RelativeAxisType::REL_HWHEEL, -notches),
                _ => (RelativeAxisType::REL_HWHEEL, notches),
            };
            Some(RawEvent::new(EV_REL, axis.0, value))
        }
        key if key.code() <= KEY_MAX => button(key.code()),
        _ => None,
    }
}

/// The uinput device of one session.
pub struct UinputDevice {
    device: VirtualDevice,
    batch: Vec<InputEvent>,
}

impl UinputDevice {
    /// Create the virtual device with the given identity.
    pub fn create(identity: &DeviceIdentity) -> Result<Self> {
        let mut keys = AttributeSet::<EvdevKey>::new();
        for code in 1..=KEY_MAX {
            keys.insert(EvdevKey::new(code));
        }

        let mut rel_axes = AttributeSet::<RelativeAxisType>::new();
        rel_axes.insert(RelativeAxisType::REL_X);
        rel_axes.insert(RelativeAxisType::REL_Y);
        rel_axes.insert(RelativeAxisType::REL_WHEEL);
        rel_axes.insert(RelativeAxisType::REL_HWHEEL);

        let device = VirtualDeviceBuilder::new()
            .map_err(|e| {
                Error::DriverUnavailable(format!(
                    "Cannot open /dev/uinput: {e}. Make sure the uinput module is loaded \
                     and /dev/uinput is accessible."
                ))
            })?
            .name(&identity.name)
            .input_id(InputId::new(
                BusType::BUS_USB,
                identity.vendor_id,
                identity.product_id,
                1,
            ))
            .with_keys(&keys)
            .map_err(|e| Error::VirtualDevice(format!("Failed to add keys: {e}")))?
            .with_relative_axes(&rel_axes)
            .map_err(|e| Error::VirtualDevice(format!("Failed to add relative axes: {e}")))?
            .build()
            .map_err(|e| Error::VirtualDevice(format!("Failed to create uinput device: {e}")))?;

        log::debug!("created uinput device '{}'", identity.name);
        Ok(Self {
            device,
            batch: Vec::new(),
        })
    }

    fn push(&mut self, raw: RawEvent) {
        self.batch
            .push(InputEvent::new(EventType(raw.kind), raw.code, raw.value));
    }
}

impl VirtualOutput for UinputDevice {
    fn send_key_event(&mut self, event: &KeyEvent) -> Result<()> {
        if let Some(raw) = native_event(event) {
            self.push(raw);
        }
        Ok(())
    }

    fn send_event(&mut self, event: &RawEvent) -> Result<()> {
        self.push(*event);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let result = self.device.emit(&self.batch);
        self.batch.clear();
        result.map_err(|e| Error::SendFailed(format!("Failed to emit events: {e}")))
    }
}

impl Drop for UinputDevice {
    fn drop(&mut self) {
        log::debug!("destroying uinput device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_key_codes_pass_through() {
        assert_eq!(
            native_event(&KeyEvent::down(Key(30))),
            Some(RawEvent::new(EV_KEY, 30, 1))
        );
        assert_eq!(
            native_event(&KeyEvent::up(Key(30))),
            Some(RawEvent::new(EV_KEY, 30, 0))
        );
    }

    #[test]
    fn test_virtual_buttons_map_to_btn_codes() {
        assert_eq!(
            native_event(&KeyEvent::down(Key::BUTTON_BACK)),
            Some(RawEvent::new(EV_KEY, BTN_SIDE, 1))
        );
    }

    #[test]
    fn test_wheel_moves_on_press_only() {
        let down = KeyEvent::with_value(Key::WHEEL_DOWN, KeyState::Down, 3);
        assert_eq!(
            native_event(&down),
            Some(RawEvent::new(EV_REL, RelativeAxisType::REL_WHEEL.0, -3))
        );
        assert_eq!(native_event(&KeyEvent::up(Key::WHEEL_DOWN)), None);
        assert_eq!(
            native_event(&KeyEvent::down(Key::WHEEL_RIGHT)),
            Some(RawEvent::new(EV_REL, RelativeAxisType::REL_HWHEEL.0, 1))
        );
    }
}
