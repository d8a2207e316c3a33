//! Interception capture thread.
//!
//! A background thread waits on the driver, correlates each stroke's slot
//! with a Raw Input device, and forwards strokes of live devices to the
//! session as [`InputEvent`]s. Strokes of ignored or unknown devices are
//! sent back to the system unchanged.

use super::interception::Interception;
use super::raw_input;
use crate::correlate::CorrelationTable;
use crate::device::GrabbedDevices;
use crate::error::{Error, Result};
use crate::event::{InputEvent, KeyEvent, KeyState};
use crate::filter::GrabFilters;
use crate::keycode::Key;
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::stroke::{
    self, FILTER_KEY_DOWN, FILTER_KEY_E0, FILTER_KEY_UP, FILTER_MOUSE_ALL, FILTER_MOUSE_MOVE,
    KeyStroke, MAX_DEVICE, MAX_KEYBOARD, MouseStroke, Stroke,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_MS: u32 = 100;
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Slots of the most recent keyboard and mouse, used as injection targets.
#[derive(Debug, Default)]
pub struct LastDevices {
    keyboard: AtomicI32,
    mouse: AtomicI32,
}

impl LastDevices {
    /// Slot of the last keyboard, 0 when none is known.
    pub fn keyboard(&self) -> i32 {
        self.keyboard.load(Ordering::Acquire)
    }

    /// Slot of the last mouse, 0 when none is known.
    pub fn mouse(&self) -> i32 {
        self.mouse.load(Ordering::Acquire)
    }

    fn record(&self, device: i32) {
        if stroke::is_keyboard(device) {
            self.keyboard.store(device, Ordering::Release);
        } else if stroke::is_mouse(device) {
            self.mouse.store(device, Ordering::Release);
        }
    }
}

/// Highest keyboard and mouse slots for which `correlated` holds.
fn highest_slots(mut correlated: impl FnMut(i32) -> bool) -> (Option<i32>, Option<i32>) {
    let (mut keyboard, mut mouse) = (None, None);
    for device in (1..=MAX_DEVICE).rev() {
        let slot = if stroke::is_keyboard(device) {
            &mut keyboard
        } else {
            &mut mouse
        };
        if slot.is_none() && correlated(device) {
            *slot = Some(device);
        }
        if keyboard.is_some() && mouse.is_some() {
            break;
        }
    }
    (keyboard, mouse)
}

/// Input events of one stroke, tracking held keys to flag repeats.
///
/// A wheel stroke yields a `Down` and an `Up` carrying the notch count.
fn stroke_events(device: i32, stroke: &Stroke, held: &mut HashSet<Key>) -> Vec<InputEvent> {
    if stroke::is_keyboard(device) {
        let event = stroke::decode_key(&KeyStroke::from(stroke));
        let repeat = match event.state {
            KeyState::Down => !held.insert(event.key),
            _ => {
                held.remove(&event.key);
                false
            }
        };
        return vec![InputEvent::Key { event, repeat }];
    }
    match stroke::decode_mouse(&MouseStroke::from(stroke)) {
        Some(event) if event.key.is_wheel() => vec![
            InputEvent::key(KeyEvent::with_value(event.key, KeyState::Down, event.value)),
            InputEvent::key(event),
        ],
        Some(event) => vec![InputEvent::key(event)],
        None => Vec::new(),
    }
}

struct CaptureThread {
    interception: Arc<Interception>,
    last: Arc<LastDevices>,
    registry: DeviceRegistry<isize>,
    table: CorrelationTable<isize>,
    held: HashSet<Key>,
    last_scan: Instant,
}

impl CaptureThread {
    fn rescan(&mut self) -> bool {
        self.last_scan = Instant::now();
        let present = raw_input::device_handles();
        let mut changed = false;

        let vanished: Vec<isize> = self
            .registry
            .live()
            .iter()
            .chain(self.registry.ignored())
            .map(|d| d.handle)
            .filter(|handle| !present.contains(handle))
            .collect();
        for handle in vanished {
            self.registry.detach(&handle);
            self.table.remove_device(handle);
            changed = true;
        }

        for handle in present {
            if self.registry.contains(&handle) {
                continue;
            }
            let Some(device) = raw_input::describe(handle) else {
                continue;
            };
            log::debug!("attached '{}' ({})", device.name, device.instance_id);
            self.table.add_device(handle, device.hardware_ids);
            self.registry
                .attach(DeviceDescriptor::new(device.name, device.instance_id, handle));
            changed = true;
        }

        if changed {
            self.find_last_devices();
        }
        changed
    }

    /// Pick injection targets before the first stroke arrives.
    fn find_last_devices(&mut self) {
        let interception = &self.interception;
        let table = &mut self.table;
        let (keyboard, mouse) = highest_slots(|device| {
            table
                .resolve(device, || interception.hardware_ids(device))
                .is_some()
        });
        for device in keyboard.into_iter().chain(mouse) {
            self.last.record(device);
        }
    }

    fn run(
        mut self,
        events: Sender<InputEvent>,
        filters: Receiver<GrabFilters>,
        shutdown: Arc<AtomicBool>,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            while let Ok(update) = filters.try_recv() {
                self.registry.set_grab_filters(update);
            }

            let device = self.interception.wait(WAIT_MS);
            if device <= 0 {
                if self.last_scan.elapsed() >= RESCAN_INTERVAL {
                    self.rescan();
                }
                continue;
            }
            let Some(stroke) = self.interception.receive(device) else {
                continue;
            };

            let interception = &self.interception;
            let captured = self.table.is_captured(&self.registry, device, || {
                interception.hardware_ids(device)
            });
            if !captured {
                self.interception.send(device, &stroke);
                continue;
            }
            self.last.record(device);
            for event in stroke_events(device, &stroke, &mut self.held) {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    }
}

/// Devices captured through the Interception driver.
pub struct InterceptionDevices {
    events: Receiver<InputEvent>,
    filters: Sender<GrabFilters>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InterceptionDevices {
    /// Enumerate devices, install driver filters and start capturing.
    pub fn open(
        interception: Arc<Interception>,
        last: Arc<LastDevices>,
        filters: GrabFilters,
    ) -> Result<Self> {
        let mut capture = CaptureThread {
            interception: Arc::clone(&interception),
            last,
            registry: DeviceRegistry::new(filters),
            table: CorrelationTable::new(),
            held: HashSet::new(),
            last_scan: Instant::now(),
        };
        capture.rescan();
        if capture.registry.live().is_empty() && capture.registry.ignored().is_empty() {
            return Err(Error::NoDevices("no keyboard or mouse found".into()));
        }

        interception.set_filters(
            FILTER_KEY_DOWN | FILTER_KEY_UP | FILTER_KEY_E0,
            FILTER_MOUSE_ALL & !FILTER_MOUSE_MOVE,
        );

        let (event_tx, event_rx) = mpsc::channel();
        let (filter_tx, filter_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("interception".into())
            .spawn(move || capture.run(event_tx, filter_rx, thread_shutdown))
            .map_err(|e| Error::ThreadError(format!("Failed to spawn capture thread: {e}")))?;

        log::debug!("capturing keyboards up to slot {MAX_KEYBOARD} and mice");
        Ok(Self {
            events: event_rx,
            filters: filter_tx,
            shutdown,
            thread: Some(thread),
        })
    }
}

impl GrabbedDevices for InterceptionDevices {
    fn read_event(&mut self, timeout: Duration) -> Result<Option<InputEvent>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::DeviceRead("capture thread stopped".into()))
            }
        }
    }

    fn set_grab_filters(&mut self, filters: GrabFilters) -> Result<()> {
        self.filters
            .send(filters)
            .map_err(|_| Error::DeviceRead("capture thread stopped".into()))
    }
}

impl Drop for InterceptionDevices {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
