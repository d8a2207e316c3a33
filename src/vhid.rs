//! Virtual HID keyboard state and service protocol.
//!
//! The macOS virtual device is driven through the Karabiner DriverKit
//! virtual HID service. This module holds everything about it that does not
//! touch the OS: the report state built from key events, the request and
//! response encoding, and the connection state machine. The socket plumbing
//! lives in the macOS backend.

use crate::event::{KeyEvent, KeyState, RawEvent};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

/// Generic desktop usage page.
pub const PAGE_GENERIC_DESKTOP: u16 = 0x01;
/// Keyboard/keypad usage page.
pub const PAGE_KEYBOARD: u16 = 0x07;
/// Consumer usage page.
pub const PAGE_CONSUMER: u16 = 0x0C;
/// Vendor page toggling raw function key mode.
pub const PAGE_RAW_FN: u16 = 0xFF;

/// First keyboard usage accepted (`a`).
pub const USAGE_KEYBOARD_A: u16 = 0x04;
/// Last keyboard usage accepted (right GUI).
pub const USAGE_KEYBOARD_RIGHT_GUI: u16 = 0xE7;
const USAGE_LEFT_CONTROL: u16 = 0xE0;
const USAGE_F1: u16 = 0x3A;

const MAX_KEYS: usize = 32;

fn is_modifier(usage: u16) -> bool {
    (USAGE_LEFT_CONTROL..=USAGE_KEYBOARD_RIGHT_GUI).contains(&usage)
}

/// Usage a function key is posted as while raw function keys are off.
///
/// Returns `(page, usage)` for F1 to F12 and `None` for every other usage.
pub fn function_key_usage(usage: u16) -> Option<(u16, u16)> {
    const MEDIA: [(u16, u16); 12] = [
        (PAGE_CONSUMER, 0x70),         // brightness down
        (PAGE_CONSUMER, 0x6F),         // brightness up
        (PAGE_CONSUMER, 0x29F),        // show all windows
        (PAGE_CONSUMER, 0x221),        // search
        (PAGE_CONSUMER, 0xCF),         // voice command
        (PAGE_GENERIC_DESKTOP, 0x9B),  // do not disturb
        (PAGE_CONSUMER, 0xB6),         // previous track
        (PAGE_CONSUMER, 0xCD),         // play/pause
        (PAGE_CONSUMER, 0xB5),         // next track
        (PAGE_CONSUMER, 0xE2),         // mute
        (PAGE_CONSUMER, 0xEA),         // volume down
        (PAGE_CONSUMER, 0xE9),         // volume up
    ];
    let index = usage.checked_sub(USAGE_F1)? as usize;
    MEDIA.get(index).copied()
}

/// Fixed-capacity set of pressed usages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySet {
    keys: [u16; MAX_KEYS],
}

impl Default for KeySet {
    fn default() -> Self {
        Self {
            keys: [0; MAX_KEYS],
        }
    }
}

impl KeySet {
    /// Add a usage; ignored when present or full.
    pub fn insert(&mut self, usage: u16) {
        if usage == 0 || self.contains(usage) {
            return;
        }
        if let Some(slot) = self.keys.iter_mut().find(|k| **k == 0) {
            *slot = usage;
        }
    }

    /// Remove a usage.
    pub fn erase(&mut self, usage: u16) {
        for slot in self.keys.iter_mut().filter(|k| **k == usage) {
            *slot = 0;
        }
    }

    /// Whether a usage is pressed.
    pub fn contains(&self, usage: u16) -> bool {
        usage != 0 && self.keys.contains(&usage)
    }

    /// Whether nothing is pressed.
    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(|k| *k == 0)
    }

    fn write(&self, out: &mut Vec<u8>) {
        for key in &self.keys {
            out.extend_from_slice(&key.to_le_bytes());
        }
    }
}

/// Which report a key event changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Keyboard,
    Consumer,
    GenericDesktop,
}

impl ReportKind {
    fn report_id(self) -> u8 {
        match self {
            ReportKind::Keyboard => 1,
            ReportKind::Consumer => 2,
            ReportKind::GenericDesktop => 5,
        }
    }
}

/// Current content of the keyboard, consumer and generic desktop reports.
#[derive(Debug, Clone, Default)]
pub struct ReportState {
    modifiers: u8,
    keyboard: KeySet,
    consumer: KeySet,
    desktop: KeySet,
    raw_function_keys: bool,
}

impl ReportState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether function keys are posted as plain F-keys.
    pub fn raw_function_keys(&self) -> bool {
        self.raw_function_keys
    }

    /// Apply a key transition; returns the report that has to be posted.
    pub fn apply(&mut self, event: &KeyEvent) -> Option<ReportKind> {
        let down = match event.state {
            KeyState::Down => true,
            KeyState::Up => false,
            KeyState::OutputOnRelease => return None,
        };
        let usage = event.key.code();
        if !event.key.is_keyboard_key() {
            return None;
        }

        let (kind, set) = match function_key_usage(usage) {
            Some((PAGE_GENERIC_DESKTOP, media)) if !self.raw_function_keys => {
                (ReportKind::GenericDesktop, Some((&mut self.desktop, media)))
            }
            Some((_, media)) if !self.raw_function_keys => {
                (ReportKind::Consumer, Some((&mut self.consumer, media)))
            }
            _ if is_modifier(usage) => {
                self.set_modifier(usage, down);
                (ReportKind::Keyboard, None)
            }
            _ => (ReportKind::Keyboard, Some((&mut self.keyboard, usage))),
        };
        if let Some((set, usage)) = set {
            if down {
                set.insert(usage);
            } else {
                set.erase(usage);
            }
        }
        Some(kind)
    }

    /// Apply a raw (page, usage, value) event; returns the report that has
    /// to be posted.
    ///
    /// Keyboard, consumer and generic desktop usages are forwarded, pressed
    /// while the value is non-zero. Keyboard usages outside `a..=right GUI`
    /// and unknown pages are dropped. The raw function key page toggles the
    /// mode and is consumed.
    pub fn apply_raw(&mut self, event: &RawEvent) -> Option<ReportKind> {
        let (page, usage, down) = (event.kind, event.code, event.value != 0);
        let (kind, set) = match page {
            PAGE_RAW_FN => {
                self.raw_function_keys = down;
                return None;
            }
            PAGE_KEYBOARD if !(USAGE_KEYBOARD_A..=USAGE_KEYBOARD_RIGHT_GUI).contains(&usage) => {
                log::debug!("dropping keyboard usage {usage:#04x} outside a..right GUI");
                return None;
            }
            PAGE_KEYBOARD if is_modifier(usage) => {
                self.set_modifier(usage, down);
                return Some(ReportKind::Keyboard);
            }
            PAGE_KEYBOARD => (ReportKind::Keyboard, &mut self.keyboard),
            PAGE_CONSUMER => (ReportKind::Consumer, &mut self.consumer),
            PAGE_GENERIC_DESKTOP => (ReportKind::GenericDesktop, &mut self.desktop),
            _ => {
                log::debug!("dropping usage {usage:#04x} of page {page:#04x}");
                return None;
            }
        };
        if down {
            set.insert(usage);
        } else {
            set.erase(usage);
        }
        Some(kind)
    }

    fn set_modifier(&mut self, usage: u16, down: bool) {
        let bit = 1u8 << (usage - USAGE_LEFT_CONTROL);
        if down {
            self.modifiers |= bit;
        } else {
            self.modifiers &= !bit;
        }
    }

    /// Serialize a report.
    pub fn report(&self, kind: ReportKind) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + MAX_KEYS * 2);
        out.push(kind.report_id());
        match kind {
            ReportKind::Keyboard => {
                out.push(self.modifiers);
                out.push(0);
                self.keyboard.write(&mut out);
            }
            ReportKind::Consumer => self.consumer.write(&mut out),
            ReportKind::GenericDesktop => self.desktop.write(&mut out),
        }
        out
    }
}

/// Requests understood by the virtual HID service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Request {
    KeyboardInitialize = 1,
    KeyboardTerminate = 2,
    KeyboardReset = 3,
    PostKeyboardReport = 7,
    PostConsumerReport = 8,
    PostGenericDesktopReport = 11,
}

impl From<ReportKind> for Request {
    fn from(kind: ReportKind) -> Self {
        match kind {
            ReportKind::Keyboard => Request::PostKeyboardReport,
            ReportKind::Consumer => Request::PostConsumerReport,
            ReportKind::GenericDesktop => Request::PostGenericDesktopReport,
        }
    }
}

/// Protocol version announced in every request.
pub const PROTOCOL_VERSION: u16 = 5;

/// Datagram types of the service transport.
pub const DATAGRAM_HEARTBEAT: u8 = 0;
pub const DATAGRAM_USER_DATA: u8 = 1;

/// Encode a request datagram.
pub fn encode_request(request: Request, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + payload.len());
    out.push(DATAGRAM_USER_DATA);
    out.extend_from_slice(b"cp");
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(request as u8);
    out.extend_from_slice(payload);
    out
}

/// Encode a heartbeat datagram announcing the next one within `deadline`.
pub fn encode_heartbeat(deadline: Duration) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(DATAGRAM_HEARTBEAT);
    out.extend_from_slice(&(deadline.as_millis().min(u32::MAX as u128) as u32).to_le_bytes());
    out
}

/// Keyboard initialization parameters.
pub fn keyboard_parameters(vendor_id: u16, product_id: u16) -> Vec<u8> {
    const COUNTRY_CODE_US: u64 = 33;
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&u64::from(vendor_id).to_le_bytes());
    out.extend_from_slice(&u64::from(product_id).to_le_bytes());
    out.extend_from_slice(&COUNTRY_CODE_US.to_le_bytes());
    out
}

/// Something the service told us, handed from its receiver thread to the
/// owner of the [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSignal {
    /// Transport to the service is up.
    Connected,
    /// The virtual keyboard is (or is no longer) ready.
    Ready(bool),
    /// The transport was closed.
    Closed,
    /// The transport failed.
    Error(String),
    /// The service could not be reached.
    ConnectFailed(String),
    /// The driver reported whether its version mismatches ours.
    VersionMismatch(bool),
    /// Informational warning.
    Warning(String),
}

/// Decode a datagram received from the service.
pub fn decode_response(datagram: &[u8]) -> Option<ServiceSignal> {
    const DRIVER_ACTIVATED: u8 = 1;
    const DRIVER_CONNECTED: u8 = 2;
    const DRIVER_VERSION_MISMATCHED: u8 = 3;
    const KEYBOARD_READY: u8 = 4;

    let &[DATAGRAM_USER_DATA, response, flag, ..] = datagram else {
        return None;
    };
    let flag = flag != 0;
    match response {
        DRIVER_ACTIVATED if !flag => Some(ServiceSignal::Warning("driver is not activated".into())),
        DRIVER_CONNECTED if !flag => Some(ServiceSignal::Warning("driver is not connected".into())),
        DRIVER_VERSION_MISMATCHED => Some(ServiceSignal::VersionMismatch(flag)),
        KEYBOARD_READY => Some(ServiceSignal::Ready(flag)),
        _ => None,
    }
}

/// Connection state of the virtual keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initializing,
    Connected,
    Disconnected,
}

/// What the owner has to do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Send the keyboard initialization request.
    InitializeKeyboard,
}

/// Connection state machine, fed by signals from the receiver thread.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    signals: Receiver<ServiceSignal>,
    version_mismatch: bool,
}

impl Connection {
    /// Start in [`ConnectionState::Initializing`].
    pub fn new(signals: Receiver<ServiceSignal>) -> Self {
        Self {
            state: ConnectionState::Initializing,
            signals,
            version_mismatch: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the driver reported a version mismatch.
    pub fn version_mismatch(&self) -> bool {
        self.version_mismatch
    }

    /// Apply one signal.
    pub fn apply(&mut self, signal: ServiceSignal) -> Option<Command> {
        match signal {
            ServiceSignal::Connected => {
                log::debug!("virtual HID service connected");
                return Some(Command::InitializeKeyboard);
            }
            ServiceSignal::Ready(true) if self.state == ConnectionState::Initializing => {
                self.state = ConnectionState::Connected;
            }
            ServiceSignal::Ready(_) => {}
            ServiceSignal::VersionMismatch(false) => {}
            ServiceSignal::VersionMismatch(true) => {
                log::error!("virtual HID driver version mismatched");
                self.version_mismatch = true;
                self.state = ConnectionState::Disconnected;
            }
            ServiceSignal::Closed => {
                log::debug!("virtual HID service closed");
                self.state = ConnectionState::Disconnected;
            }
            ServiceSignal::Error(message) => {
                log::error!("virtual HID service error: {message}");
                self.state = ConnectionState::Disconnected;
            }
            ServiceSignal::ConnectFailed(message) => {
                log::debug!("virtual HID service connect failed: {message}");
                self.state = ConnectionState::Disconnected;
            }
            ServiceSignal::Warning(message) => {
                log::debug!("virtual HID service warning: {message}");
            }
        }
        None
    }

    /// Apply every pending signal.
    pub fn pump(&mut self, mut on_command: impl FnMut(Command)) {
        loop {
            match self.signals.try_recv() {
                Ok(signal) => {
                    if let Some(command) = self.apply(signal) {
                        on_command(command);
                    }
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.state = ConnectionState::Disconnected;
                    return;
                }
            }
        }
    }

    /// Poll up to `attempts` times, `interval` apart, while the state is
    /// `state`. Returns the state reached.
    pub fn wait_while(
        &mut self,
        state: ConnectionState,
        attempts: u32,
        interval: Duration,
        mut on_command: impl FnMut(Command),
    ) -> ConnectionState {
        for _ in 0..attempts {
            self.pump(&mut on_command);
            if self.state != state {
                break;
            }
            std::thread::sleep(interval);
        }
        self.pump(&mut on_command);
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keycode::Key;
    use std::sync::mpsc;

    const F1: Key = Key(0x3A);
    const F6: Key = Key(0x3F);
    const A: Key = Key(0x04);
    const LEFT_SHIFT: Key = Key(0xE1);

    #[test]
    fn test_function_keys_map_to_media_usages() {
        assert_eq!(function_key_usage(0x3A), Some((PAGE_CONSUMER, 0x70)));
        assert_eq!(function_key_usage(0x3F), Some((PAGE_GENERIC_DESKTOP, 0x9B)));
        assert_eq!(function_key_usage(0x45), Some((PAGE_CONSUMER, 0xE9)));
        assert_eq!(function_key_usage(0x46), None);
        assert_eq!(function_key_usage(0x04), None);
    }

    #[test]
    fn test_reports_follow_key_events() {
        let mut state = ReportState::new();
        assert_eq!(state.apply(&KeyEvent::down(A)), Some(ReportKind::Keyboard));
        assert_eq!(state.apply(&KeyEvent::down(LEFT_SHIFT)), Some(ReportKind::Keyboard));
        let report = state.report(ReportKind::Keyboard);
        assert_eq!(report[0], 1);
        assert_eq!(report[1], 0b10);
        assert_eq!(&report[3..5], &[0x04, 0x00]);

        assert_eq!(state.apply(&KeyEvent::down(F1)), Some(ReportKind::Consumer));
        assert_eq!(&state.report(ReportKind::Consumer)[1..3], &[0x70, 0x00]);
        assert_eq!(state.apply(&KeyEvent::down(F6)), Some(ReportKind::GenericDesktop));

        state.apply(&KeyEvent::up(A));
        state.apply(&KeyEvent::up(LEFT_SHIFT));
        let report = state.report(ReportKind::Keyboard);
        assert!(report[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_raw_function_key_toggle() {
        let mut state = ReportState::new();
        assert_eq!(state.apply_raw(&RawEvent::new(PAGE_RAW_FN, 3, 1)), None);
        assert!(state.raw_function_keys());
        assert_eq!(state.apply(&KeyEvent::down(F1)), Some(ReportKind::Keyboard));

        assert_eq!(state.apply_raw(&RawEvent::new(PAGE_RAW_FN, 3, 0)), None);
        assert_eq!(state.apply(&KeyEvent::down(F1)), Some(ReportKind::Consumer));
    }

    #[test]
    fn test_raw_keyboard_usage_range() {
        let mut state = ReportState::new();
        assert_eq!(
            state.apply_raw(&RawEvent::new(PAGE_KEYBOARD, 0x04, 1)),
            Some(ReportKind::Keyboard)
        );
        assert_eq!(
            state.apply_raw(&RawEvent::new(PAGE_KEYBOARD, 0xE7, 1)),
            Some(ReportKind::Keyboard)
        );
        assert_eq!(state.report(ReportKind::Keyboard)[1], 0x80);
        assert_eq!(state.apply_raw(&RawEvent::new(PAGE_KEYBOARD, 0x01, 1)), None);
        assert_eq!(state.apply_raw(&RawEvent::new(PAGE_KEYBOARD, 0xE8, 1)), None);
        assert_eq!(state.apply_raw(&RawEvent::new(0x09, 0x01, 1)), None);
    }

    #[test]
    fn test_raw_media_usages_are_forwarded() {
        let mut state = ReportState::new();
        // volume up
        assert_eq!(
            state.apply_raw(&RawEvent::new(PAGE_CONSUMER, 0xE9, 1)),
            Some(ReportKind::Consumer)
        );
        assert_eq!(&state.report(ReportKind::Consumer)[..3], &[2, 0xE9, 0x00]);
        assert_eq!(
            state.apply_raw(&RawEvent::new(PAGE_CONSUMER, 0xE9, 0)),
            Some(ReportKind::Consumer)
        );
        assert!(state.report(ReportKind::Consumer)[1..].iter().all(|b| *b == 0));

        // system sleep
        assert_eq!(
            state.apply_raw(&RawEvent::new(PAGE_GENERIC_DESKTOP, 0x82, 1)),
            Some(ReportKind::GenericDesktop)
        );
        assert_eq!(&state.report(ReportKind::GenericDesktop)[..3], &[5, 0x82, 0x00]);
    }

    #[test]
    fn test_key_set_capacity() {
        let mut set = KeySet::default();
        for usage in 1..=40 {
            set.insert(usage);
        }
        assert!(set.contains(32));
        assert!(!set.contains(33));
        set.erase(5);
        set.insert(40);
        assert!(set.contains(40));
    }

    #[test]
    fn test_request_encoding() {
        let bytes = encode_request(Request::PostConsumerReport, &[2, 0x70, 0]);
        assert_eq!(bytes, vec![1, b'c', b'p', 5, 0, 8, 2, 0x70, 0]);
        assert_eq!(keyboard_parameters(0x1209, 0x5245).len(), 24);
    }

    #[test]
    fn test_decode_response() {
        assert_eq!(decode_response(&[1, 4, 1]), Some(ServiceSignal::Ready(true)));
        assert_eq!(decode_response(&[1, 3, 1]), Some(ServiceSignal::VersionMismatch(true)));
        assert_eq!(decode_response(&[0, 4, 1]), None);
        assert_eq!(decode_response(&[1]), None);
    }

    #[test]
    fn test_connection_state_machine() {
        let (tx, rx) = mpsc::channel();
        let mut connection = Connection::new(rx);
        tx.send(ServiceSignal::Connected).unwrap();
        tx.send(ServiceSignal::Ready(true)).unwrap();

        let mut commands = Vec::new();
        let state = connection.wait_while(
            ConnectionState::Initializing,
            30,
            Duration::from_millis(1),
            |c| commands.push(c),
        );
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(commands, vec![Command::InitializeKeyboard]);

        // ready while already connected changes nothing
        assert_eq!(connection.apply(ServiceSignal::Ready(true)), None);
        assert_eq!(connection.state(), ConnectionState::Connected);

        connection.apply(ServiceSignal::Closed);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_version_mismatch_disconnects() {
        let (tx, rx) = mpsc::channel();
        let mut connection = Connection::new(rx);
        tx.send(ServiceSignal::VersionMismatch(true)).unwrap();
        let state =
            connection.wait_while(ConnectionState::Initializing, 3, Duration::from_millis(1), |_| {});
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(connection.version_mismatch());
    }

    #[test]
    fn test_wait_is_bounded() {
        let (_tx, rx) = mpsc::channel();
        let mut connection = Connection::new(rx);
        let state =
            connection.wait_while(ConnectionState::Initializing, 3, Duration::from_millis(1), |_| {});
        assert_eq!(state, ConnectionState::Initializing);
    }

    #[test]
    fn test_receiver_gone_means_disconnected() {
        let (tx, rx) = mpsc::channel();
        let mut connection = Connection::new(rx);
        drop(tx);
        connection.pump(|_| {});
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
