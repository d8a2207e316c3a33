//! Key code definitions.
//!
//! A [`Key`] carries the platform's native code for keyboard keys:
//!
//! - **Linux**: evdev key codes (`KEY_*`, `BTN_*`)
//! - **Windows**: PS/2 scan codes, with `0xE000` set for extended (E0) keys
//! - **macOS**: HID keyboard page usages
//!
//! Mouse buttons and wheels that do not have a native key code on every
//! platform use virtual codes from `0xF000` upwards.

use serde::{Deserialize, Serialize};
use std::fmt;

/// First code of the platform-independent virtual range.
const VIRTUAL_BASE: u16 = 0xF000;

/// A key or button code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub u16);

impl Key {
    /// No key.
    pub const NONE: Key = Key(0);

    // Mouse buttons
    /// Left mouse button.
    pub const BUTTON_LEFT: Key = Key(VIRTUAL_BASE + 1);
    /// Right mouse button.
    pub const BUTTON_RIGHT: Key = Key(VIRTUAL_BASE + 2);
    /// Middle mouse button.
    pub const BUTTON_MIDDLE: Key = Key(VIRTUAL_BASE + 3);
    /// Back (X1) mouse button.
    pub const BUTTON_BACK: Key = Key(VIRTUAL_BASE + 4);
    /// Forward (X2) mouse button.
    pub const BUTTON_FORWARD: Key = Key(VIRTUAL_BASE + 5);

    // Wheels
    /// Vertical wheel, away from the user.
    pub const WHEEL_UP: Key = Key(VIRTUAL_BASE + 16);
    /// Vertical wheel, toward the user.
    pub const WHEEL_DOWN: Key = Key(VIRTUAL_BASE + 17);
    /// Horizontal wheel, left.
    pub const WHEEL_LEFT: Key = Key(VIRTUAL_BASE + 18);
    /// Horizontal wheel, right.
    pub const WHEEL_RIGHT: Key = Key(VIRTUAL_BASE + 19);

    /// Raw code value.
    #[inline]
    pub fn code(self) -> u16 {
        self.0
    }

    /// Whether this is a keyboard key (as opposed to a virtual mouse code).
    #[inline]
    pub fn is_keyboard_key(self) -> bool {
        self != Key::NONE && self.0 < VIRTUAL_BASE
    }

    /// Whether this is one of the virtual mouse button codes.
    pub fn is_mouse_button(self) -> bool {
        matches!(
            self,
            Key::BUTTON_LEFT
                | Key::BUTTON_RIGHT
                | Key::BUTTON_MIDDLE
                | Key::BUTTON_BACK
                | Key::BUTTON_FORWARD
        )
    }

    /// Whether this is one of the virtual wheel codes.
    pub fn is_wheel(self) -> bool {
        matches!(
            self,
            Key::WHEEL_UP | Key::WHEEL_DOWN | Key::WHEEL_LEFT | Key::WHEEL_RIGHT
        )
    }
}

impl From<u16> for Key {
    fn from(code: u16) -> Self {
        Key(code)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Key::BUTTON_LEFT => f.write_str("ButtonLeft"),
            Key::BUTTON_RIGHT => f.write_str("ButtonRight"),
            Key::BUTTON_MIDDLE => f.write_str("ButtonMiddle"),
            Key::BUTTON_BACK => f.write_str("ButtonBack"),
            Key::BUTTON_FORWARD => f.write_str("ButtonForward"),
            Key::WHEEL_UP => f.write_str("WheelUp"),
            Key::WHEEL_DOWN => f.write_str("WheelDown"),
            Key::WHEEL_LEFT => f.write_str("WheelLeft"),
            Key::WHEEL_RIGHT => f.write_str("WheelRight"),
            Key(code) => write!(f, "0x{code:04X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_classes() {
        assert!(Key(30).is_keyboard_key());
        assert!(Key(0xE01D).is_keyboard_key());
        assert!(!Key::NONE.is_keyboard_key());
        assert!(!Key::BUTTON_LEFT.is_keyboard_key());
        assert!(Key::BUTTON_FORWARD.is_mouse_button());
        assert!(Key::WHEEL_DOWN.is_wheel());
        assert!(!Key::WHEEL_DOWN.is_mouse_button());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::WHEEL_UP.to_string(), "WheelUp");
        assert_eq!(Key(0x1E).to_string(), "0x001E");
    }

    #[test]
    fn test_key_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Key(30)).unwrap(), "30");
        let key: Key = serde_json::from_str("61441").unwrap();
        assert_eq!(key, Key::BUTTON_LEFT);
    }
}
