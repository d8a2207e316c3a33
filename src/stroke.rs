//! Interception driver strokes and their conversion to key events.
//!
//! The driver exchanges fixed-size strokes: a keyboard stroke carries a
//! PS/2 scan code plus state flags, a mouse stroke carries button
//! transitions and wheel deltas. Strokes are kept as plain byte buffers
//! with explicit little-endian accessors, so the conversions can be used
//! and tested on every target.

use crate::event::{KeyEvent, KeyState};
use crate::keycode::Key;

/// Flag marking an extended scan code in a [`Key`].
pub const EXTENDED_FLAG: u16 = 0xE000;

/// Wheel delta of one notch.
pub const WHEEL_DELTA: i32 = 120;

// Keyboard stroke state.
pub const KEY_DOWN: u16 = 0x00;
pub const KEY_UP: u16 = 0x01;
pub const KEY_E0: u16 = 0x02;
pub const KEY_E1: u16 = 0x04;

// Mouse stroke state.
pub const MOUSE_BUTTON_1_DOWN: u16 = 0x001;
pub const MOUSE_BUTTON_1_UP: u16 = 0x002;
pub const MOUSE_BUTTON_2_DOWN: u16 = 0x004;
pub const MOUSE_BUTTON_2_UP: u16 = 0x008;
pub const MOUSE_BUTTON_3_DOWN: u16 = 0x010;
pub const MOUSE_BUTTON_3_UP: u16 = 0x020;
pub const MOUSE_BUTTON_4_DOWN: u16 = 0x040;
pub const MOUSE_BUTTON_4_UP: u16 = 0x080;
pub const MOUSE_BUTTON_5_DOWN: u16 = 0x100;
pub const MOUSE_BUTTON_5_UP: u16 = 0x200;
pub const MOUSE_WHEEL: u16 = 0x400;
pub const MOUSE_HWHEEL: u16 = 0x800;

// Capture filters.
pub const FILTER_KEY_DOWN: u16 = 0x01;
pub const FILTER_KEY_UP: u16 = 0x02;
pub const FILTER_KEY_E0: u16 = 0x04;
pub const FILTER_MOUSE_ALL: u16 = 0xFFFF;
pub const FILTER_MOUSE_MOVE: u16 = 0x1000;

/// Device indices: keyboards are `1..=MAX_KEYBOARD`, mice follow up to
/// `MAX_DEVICE`.
pub const MAX_KEYBOARD: i32 = 10;
pub const MAX_DEVICE: i32 = 20;

/// Whether a device index refers to a keyboard.
pub fn is_keyboard(device: i32) -> bool {
    (1..=MAX_KEYBOARD).contains(&device)
}

/// Whether a device index refers to a mouse.
pub fn is_mouse(device: i32) -> bool {
    (MAX_KEYBOARD + 1..=MAX_DEVICE).contains(&device)
}

/// Size of the driver's stroke buffer (the larger mouse stroke).
pub const STROKE_SIZE: usize = 20;

/// Raw stroke as exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(4))]
pub struct Stroke(pub [u8; STROKE_SIZE]);

impl Stroke {
    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.0[offset], self.0[offset + 1]])
    }

    fn i32_at(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// Keyboard stroke: `{code: u16, state: u16, information: u32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyStroke {
    pub code: u16,
    pub state: u16,
    pub information: u32,
}

impl From<&Stroke> for KeyStroke {
    fn from(stroke: &Stroke) -> Self {
        Self {
            code: stroke.u16_at(0),
            state: stroke.u16_at(2),
            information: stroke.i32_at(4) as u32,
        }
    }
}

impl From<KeyStroke> for Stroke {
    fn from(key: KeyStroke) -> Self {
        let mut stroke = Stroke::default();
        stroke.put(0, &key.code.to_le_bytes());
        stroke.put(2, &key.state.to_le_bytes());
        stroke.put(4, &key.information.to_le_bytes());
        stroke
    }
}

/// Mouse stroke: `{state: u16, flags: u16, rolling: i16, x: i32, y: i32,
/// information: u32}` with C layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseStroke {
    pub state: u16,
    pub flags: u16,
    pub rolling: i16,
    pub x: i32,
    pub y: i32,
    pub information: u32,
}

impl From<&Stroke> for MouseStroke {
    fn from(stroke: &Stroke) -> Self {
        Self {
            state: stroke.u16_at(0),
            flags: stroke.u16_at(2),
            rolling: stroke.u16_at(4) as i16,
            x: stroke.i32_at(8),
            y: stroke.i32_at(12),
            information: stroke.i32_at(16) as u32,
        }
    }
}

impl From<MouseStroke> for Stroke {
    fn from(mouse: MouseStroke) -> Self {
        let mut stroke = Stroke::default();
        stroke.put(0, &mouse.state.to_le_bytes());
        stroke.put(2, &mouse.flags.to_le_bytes());
        stroke.put(4, &mouse.rolling.to_le_bytes());
        stroke.put(8, &mouse.x.to_le_bytes());
        stroke.put(12, &mouse.y.to_le_bytes());
        stroke.put(16, &mouse.information.to_le_bytes());
        stroke
    }
}

/// Decode a keyboard stroke. E0-prefixed scan codes get [`EXTENDED_FLAG`].
pub fn decode_key(stroke: &KeyStroke) -> KeyEvent {
    let extended = if stroke.state & KEY_E0 != 0 {
        EXTENDED_FLAG
    } else {
        0
    };
    let state = if stroke.state & KEY_UP != 0 {
        KeyState::Up
    } else {
        KeyState::Down
    };
    KeyEvent::new(Key(stroke.code | extended), state)
}

/// Encode a key event as a keyboard stroke.
pub fn encode_key(event: &KeyEvent) -> KeyStroke {
    let mut code = event.key.code();
    let mut state = if event.state == KeyState::Up {
        KEY_UP
    } else {
        KEY_DOWN
    };
    if code & EXTENDED_FLAG != 0 {
        code &= !EXTENDED_FLAG;
        state |= KEY_E0;
    }
    KeyStroke {
        code,
        state,
        information: 0,
    }
}

const BUTTONS: [(Key, u16, u16); 5] = [
    (Key::BUTTON_LEFT, MOUSE_BUTTON_1_DOWN, MOUSE_BUTTON_1_UP),
    (Key::BUTTON_RIGHT, MOUSE_BUTTON_2_DOWN, MOUSE_BUTTON_2_UP),
    (Key::BUTTON_MIDDLE, MOUSE_BUTTON_3_DOWN, MOUSE_BUTTON_3_UP),
    (Key::BUTTON_BACK, MOUSE_BUTTON_4_DOWN, MOUSE_BUTTON_4_UP),
    (Key::BUTTON_FORWARD, MOUSE_BUTTON_5_DOWN, MOUSE_BUTTON_5_UP),
];

fn notches(rolling: i16) -> u16 {
    (i32::from(rolling).abs() / WHEEL_DELTA).max(1) as u16
}

/// Decode a mouse stroke.
///
/// Wheel strokes become an `Up` event of the matching wheel key carrying
/// the number of notches; the caller inserts the `Down`. Returns `None`
/// for strokes without a button or wheel transition.
pub fn decode_mouse(stroke: &MouseStroke) -> Option<KeyEvent> {
    for (key, down, up) in BUTTONS {
        if stroke.state & (down | up) != 0 {
            let state = if stroke.state & up != 0 {
                KeyState::Up
            } else {
                KeyState::Down
            };
            return Some(KeyEvent::new(key, state));
        }
    }
    if stroke.state & MOUSE_WHEEL != 0 {
        let key = if stroke.rolling < 0 {
            Key::WHEEL_DOWN
        } else {
            Key::WHEEL_UP
        };
        return Some(KeyEvent::with_value(key, KeyState::Up, notches(stroke.rolling)));
    }
    if stroke.state & MOUSE_HWHEEL != 0 {
        let key = if stroke.rolling < 0 {
            Key::WHEEL_LEFT
        } else {
            Key::WHEEL_RIGHT
        };
        return Some(KeyEvent::with_value(key, KeyState::Up, notches(stroke.rolling)));
    }
    None
}

/// Encode a mouse button or wheel event as a mouse stroke.
///
/// A wheel event scrolls by `value` notches, one when `value` is 0.
/// Returns `None` for keys that are neither buttons nor wheels.
pub fn encode_mouse(event: &KeyEvent) -> Option<MouseStroke> {
    let down = event.state == KeyState::Down;
    if let Some(&(_, down_flag, up_flag)) = BUTTONS.iter().find(|(key, _, _)| *key == event.key) {
        return Some(MouseStroke {
            state: if down { down_flag } else { up_flag },
            ..Default::default()
        });
    }
    if !event.key.is_wheel() {
        return None;
    }
    let vertical = matches!(event.key, Key::WHEEL_UP | Key::WHEEL_DOWN);
    let negative = matches!(event.key, Key::WHEEL_DOWN | Key::WHEEL_LEFT);
    let notches = if event.value == 0 {
        1
    } else {
        i32::from(event.value)
    };
    let magnitude = (notches * WHEEL_DELTA).min(i32::from(i16::MAX));
    let rolling = if negative { -magnitude } else { magnitude };
    Some(MouseStroke {
        state: if vertical { MOUSE_WHEEL } else { MOUSE_HWHEEL },
        rolling: rolling as i16,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_scan_code_round_trip() {
        // right arrow is E0 4D
        let stroke = KeyStroke {
            code: 0x4D,
            state: KEY_E0 | KEY_UP,
            information: 0,
        };
        let event = decode_key(&stroke);
        assert_eq!(event, KeyEvent::up(Key(0xE04D)));
        assert_eq!(encode_key(&event), stroke);

        let plain = encode_key(&KeyEvent::down(Key(0x1E)));
        assert_eq!(plain.code, 0x1E);
        assert_eq!(plain.state, KEY_DOWN);
    }

    #[test]
    fn test_wheel_scroll_normalized_to_notches() {
        let stroke = MouseStroke {
            state: MOUSE_WHEEL,
            rolling: -3 * WHEEL_DELTA as i16,
            ..Default::default()
        };
        let event = decode_mouse(&stroke).unwrap();
        assert_eq!(event, KeyEvent::with_value(Key::WHEEL_DOWN, KeyState::Up, 3));

        let back = encode_mouse(&KeyEvent::with_value(Key::WHEEL_DOWN, KeyState::Down, 3)).unwrap();
        assert_eq!(back.state, MOUSE_WHEEL);
        assert_eq!(back.rolling, -360);
    }

    #[test]
    fn test_wheel_without_value_scrolls_one_notch() {
        let stroke = encode_mouse(&KeyEvent::down(Key::WHEEL_RIGHT)).unwrap();
        assert_eq!(stroke.state, MOUSE_HWHEEL);
        assert_eq!(stroke.rolling, 120);

        // fine-grained deltas still count as a notch
        let fine = MouseStroke {
            state: MOUSE_WHEEL,
            rolling: 30,
            ..Default::default()
        };
        assert_eq!(decode_mouse(&fine).unwrap().value, 1);
    }

    #[test]
    fn test_buttons() {
        let up = MouseStroke {
            state: MOUSE_BUTTON_4_UP,
            ..Default::default()
        };
        assert_eq!(decode_mouse(&up), Some(KeyEvent::up(Key::BUTTON_BACK)));
        assert_eq!(
            encode_mouse(&KeyEvent::down(Key::BUTTON_RIGHT)).unwrap().state,
            MOUSE_BUTTON_2_DOWN
        );
        assert_eq!(decode_mouse(&MouseStroke::default()), None);
        assert_eq!(encode_mouse(&KeyEvent::down(Key(30))), None);
    }

    #[test]
    fn test_stroke_layout() {
        let mouse = MouseStroke {
            state: MOUSE_WHEEL,
            flags: 0,
            rolling: -120,
            x: 5,
            y: -7,
            information: 9,
        };
        let stroke = Stroke::from(mouse);
        assert_eq!(&stroke.0[4..6], &(-120i16).to_le_bytes());
        assert_eq!(MouseStroke::from(&stroke), mouse);

        let key = KeyStroke {
            code: 0x1C,
            state: KEY_E0,
            information: 1,
        };
        assert_eq!(KeyStroke::from(&Stroke::from(key)), key);
    }

    #[test]
    fn test_device_ranges() {
        assert!(is_keyboard(1) && is_keyboard(10));
        assert!(is_mouse(11) && is_mouse(20));
        assert!(!is_keyboard(0) && !is_mouse(21));
    }
}
