//! Event types flowing through the translation loop.

use crate::keycode::Key;
use serde::{Deserialize, Serialize};

// Linux input event classes, also used as the generic raw-event vocabulary.
/// Synchronization event class (`EV_SYN`).
pub const EV_SYN: u16 = 0x00;
/// Key and button event class (`EV_KEY`).
pub const EV_KEY: u16 = 0x01;
/// Relative axis event class (`EV_REL`).
pub const EV_REL: u16 = 0x02;
/// Miscellaneous event class (`EV_MSC`).
pub const EV_MSC: u16 = 0x04;

/// State transition carried by a [`KeyEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyState {
    /// Key was released.
    Up,
    /// Key was pressed (or auto-repeated).
    Down,
    /// Sentinel: withhold the following events until the triggering
    /// physical key is released.
    OutputOnRelease,
}

/// One state transition of a key or button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyEvent {
    /// The key code.
    pub key: Key,
    /// Down, Up or the OutputOnRelease sentinel.
    pub state: KeyState,
    /// Repeat count or wheel magnitude, 0 when absent.
    #[serde(default)]
    pub value: u16,
}

impl KeyEvent {
    /// Create an event without a magnitude.
    pub const fn new(key: Key, state: KeyState) -> Self {
        Self {
            key,
            state,
            value: 0,
        }
    }

    /// Create an event carrying a magnitude.
    pub const fn with_value(key: Key, state: KeyState, value: u16) -> Self {
        Self { key, state, value }
    }

    /// Key pressed.
    pub const fn down(key: Key) -> Self {
        Self::new(key, KeyState::Down)
    }

    /// Key released.
    pub const fn up(key: Key) -> Self {
        Self::new(key, KeyState::Up)
    }

    /// The OutputOnRelease sentinel.
    pub const fn output_on_release() -> Self {
        Self::new(Key::NONE, KeyState::OutputOnRelease)
    }

    /// Whether this is the OutputOnRelease sentinel.
    #[inline]
    pub fn is_output_on_release(&self) -> bool {
        self.state == KeyState::OutputOnRelease
    }
}

/// Ordered output of the remap stage.
pub type KeySequence = Vec<KeyEvent>;

/// A raw (type, code, value) triple as read from a device.
///
/// On macOS `kind` is the HID usage page and `code` the usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent {
    /// Event class or usage page.
    pub kind: u16,
    /// Event code or usage.
    pub code: u16,
    /// Event value.
    pub value: i32,
}

impl RawEvent {
    /// Create a raw event.
    pub const fn new(kind: u16, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }
}

/// An event delivered by a grab backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// A key or button transition, normalized to Down/Up.
    Key {
        /// The normalized event.
        event: KeyEvent,
        /// Set for OS auto-repeat indications.
        repeat: bool,
    },
    /// Synchronization or miscellaneous event, never forwarded.
    Sync,
    /// Anything the remap layer does not interpret; forwarded verbatim.
    Passthrough(RawEvent),
}

impl InputEvent {
    /// A fresh key press or release.
    pub fn key(event: KeyEvent) -> Self {
        InputEvent::Key {
            event,
            repeat: false,
        }
    }

    /// Classify an evdev-style (type, code, value) triple.
    ///
    /// Key values are 0 (release), 1 (press) and 2 (auto-repeat).
    pub fn from_raw(raw: RawEvent) -> Self {
        match raw.kind {
            EV_KEY => {
                let state = if raw.value == 0 {
                    KeyState::Up
                } else {
                    KeyState::Down
                };
                InputEvent::Key {
                    event: KeyEvent::new(Key(raw.code), state),
                    repeat: raw.value == 2,
                }
            }
            EV_SYN | EV_MSC => InputEvent::Sync,
            _ => InputEvent::Passthrough(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_key_states() {
        assert_eq!(
            InputEvent::from_raw(RawEvent::new(EV_KEY, 30, 1)),
            InputEvent::Key {
                event: KeyEvent::down(Key(30)),
                repeat: false
            }
        );
        assert_eq!(
            InputEvent::from_raw(RawEvent::new(EV_KEY, 30, 0)),
            InputEvent::Key {
                event: KeyEvent::up(Key(30)),
                repeat: false
            }
        );
        assert_eq!(
            InputEvent::from_raw(RawEvent::new(EV_KEY, 30, 2)),
            InputEvent::Key {
                event: KeyEvent::down(Key(30)),
                repeat: true
            }
        );
    }

    #[test]
    fn test_from_raw_drops_sync_and_misc() {
        assert_eq!(InputEvent::from_raw(RawEvent::new(EV_SYN, 0, 0)), InputEvent::Sync);
        assert_eq!(InputEvent::from_raw(RawEvent::new(EV_MSC, 4, 458756)), InputEvent::Sync);
    }

    #[test]
    fn test_from_raw_passthrough() {
        let wheel = RawEvent::new(EV_REL, 8, -1);
        assert_eq!(InputEvent::from_raw(wheel), InputEvent::Passthrough(wheel));
    }

    #[test]
    fn test_key_event_json_defaults_value() {
        let event: KeyEvent = serde_json::from_str(r#"{"key":30,"state":"Down"}"#).unwrap();
        assert_eq!(event, KeyEvent::down(Key(30)));
    }
}
