//! Exclusive grabs of evdev input devices.
//!
//! Reads input events directly from `/dev/input/event*`. Live devices are
//! grabbed with `EVIOCGRAB` so their events reach only this process;
//! ignored devices stay open but are neither grabbed nor read.

use crate::device::{DeviceIdentity, GrabbedDevices};
use crate::error::{Error, Result};
use crate::event::{InputEvent, RawEvent};
use crate::filter::GrabFilters;
use crate::registry::{DeviceDescriptor, DeviceRegistry, GrabChange};
use evdev::{Device, EventType};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

const INPUT_DIR: &str = "/dev/input";

struct OpenDevice {
    path: PathBuf,
    device: Device,
    grabbed: bool,
}

/// The evdev devices of one session.
pub struct GrabbedKeyboards {
    identity: DeviceIdentity,
    registry: DeviceRegistry<PathBuf>,
    devices: Vec<OpenDevice>,
    pending: VecDeque<InputEvent>,
}

fn descriptor(path: &Path, device: &Device) -> DeviceDescriptor<PathBuf> {
    let id = device.input_id();
    DeviceDescriptor::new(
        device.name().unwrap_or("unknown"),
        format!("{:04x}:{:04x}", id.vendor(), id.product()),
        path.to_path_buf(),
    )
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with("event"))
        .unwrap_or(false)
}

fn is_eligible(device: &Device) -> bool {
    let supported = device.supported_events();
    supported.contains(EventType::KEY) || supported.contains(EventType::RELATIVE)
}

fn grab_error(path: &Path, e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::EBUSY) => Error::DeviceBusy(format!(
            "{} is grabbed by another process",
            path.display()
        )),
        Some(libc::EACCES) | Some(libc::EPERM) => Error::PermissionDenied(format!(
            "cannot grab {}: {e}. Make sure you're in the 'input' group.",
            path.display()
        )),
        _ => Error::DeviceRead(format!("cannot grab {}: {e}", path.display())),
    }
}

impl GrabbedKeyboards {
    /// Open every eligible device and grab those the filters select.
    pub fn open(identity: &DeviceIdentity, filters: GrabFilters) -> Result<Self> {
        let mut devices = Self {
            identity: identity.clone(),
            registry: DeviceRegistry::new(filters),
            devices: Vec::new(),
            pending: VecDeque::new(),
        };
        fs::read_dir(INPUT_DIR).map_err(|e| {
            Error::PermissionDenied(format!(
                "Cannot access {INPUT_DIR}: {e}. Make sure you're in the 'input' group."
            ))
        })?;
        devices.rescan();

        if devices.devices.is_empty() {
            return Err(Error::NoDevices(
                "no accessible keyboard or mouse under /dev/input".into(),
            ));
        }
        devices.sync_grabs()?;
        Ok(devices)
    }

    /// Attach new nodes and detach vanished ones.
    fn rescan(&mut self) {
        let Ok(dir) = fs::read_dir(INPUT_DIR) else {
            return;
        };
        let present: Vec<PathBuf> = dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_event_node(path))
            .collect();

        let vanished: Vec<PathBuf> = self
            .devices
            .iter()
            .filter(|d| !present.contains(&d.path))
            .map(|d| d.path.clone())
            .collect();
        for path in vanished {
            self.detach(&path);
        }

        for path in present {
            if self.devices.iter().any(|d| d.path == path) {
                continue;
            }
            let device = match Device::open(&path) {
                Ok(device) => device,
                Err(e) => {
                    log::debug!("Failed to open {}: {}", path.display(), e);
                    continue;
                }
            };
            if !is_eligible(&device) {
                continue;
            }
            let id = device.input_id();
            if self
                .identity
                .matches(device.name().unwrap_or(""), id.vendor(), id.product())
            {
                continue;
            }
            self.registry.attach(descriptor(&path, &device));
            self.devices.push(OpenDevice {
                path,
                device,
                grabbed: false,
            });
        }
    }

    fn detach(&mut self, path: &Path) {
        self.registry.detach(&path.to_path_buf());
        self.devices.retain(|d| d.path != path);
    }

    /// Grab live devices and release ignored ones.
    fn sync_grabs(&mut self) -> Result<()> {
        for open in &mut self.devices {
            match self.registry.grab_change(&open.path, open.grabbed) {
                Some(GrabChange::Grab) => {
                    open.device.grab().map_err(|e| grab_error(&open.path, e))?;
                    open.grabbed = true;
                    log::debug!("grabbed {}", open.path.display());
                }
                Some(GrabChange::Release) => {
                    if let Err(e) = open.device.ungrab() {
                        log::warn!("Failed to release {}: {}", open.path.display(), e);
                    }
                    open.grabbed = false;
                    log::debug!("released {}", open.path.display());
                }
                None => {}
            }
        }
        Ok(())
    }

    fn on_timeout(&mut self) -> Result<()> {
        self.rescan();
        // a newly attached device may be busy; skip it rather than end
        match self.sync_grabs() {
            Err(Error::DeviceBusy(message)) => {
                log::warn!("{message}");
                Ok(())
            }
            other => other,
        }
    }
}

impl GrabbedDevices for GrabbedKeyboards {
    fn read_event(&mut self, timeout: Duration) -> Result<Option<InputEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let grabbed: Vec<usize> = (0..self.devices.len())
            .filter(|&i| self.devices[i].grabbed)
            .collect();
        if grabbed.is_empty() {
            std::thread::sleep(timeout);
            self.on_timeout()?;
            return Ok(None);
        }

        let mut poll_fds: Vec<libc::pollfd> = grabbed
            .iter()
            .map(|&i| libc::pollfd {
                fd: self.devices[i].device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let ret = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as _,
                timeout.as_millis() as _,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(Error::DeviceRead(format!("poll error: {err}")));
        }
        if ret == 0 {
            self.on_timeout()?;
            return Ok(None);
        }

        let mut lost = Vec::new();
        for (pfd, &index) in poll_fds.iter().zip(&grabbed) {
            let open = &mut self.devices[index];
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                lost.push(open.path.clone());
                continue;
            }
            if pfd.revents & libc::POLLIN == 0 {
                continue;
            }
            match open.device.fetch_events() {
                Ok(events) => {
                    for ev in events {
                        let raw = RawEvent::new(ev.event_type().0, ev.code(), ev.value());
                        self.pending.push_back(InputEvent::from_raw(raw));
                    }
                }
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => lost.push(open.path.clone()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(Error::DeviceRead(format!("{}: {e}", open.path.display())));
                }
            }
        }
        let lost_any = !lost.is_empty();
        for path in lost {
            log::debug!("{} vanished", path.display());
            self.detach(&path);
        }
        if lost_any && !self.devices.iter().any(|d| d.grabbed) {
            return Err(Error::DeviceRead("all grabbed devices are gone".into()));
        }

        Ok(self.pending.pop_front())
    }

    fn set_grab_filters(&mut self, filters: GrabFilters) -> Result<()> {
        self.registry.set_grab_filters(filters);
        self.sync_grabs()
    }
}

impl Drop for GrabbedKeyboards {
    fn drop(&mut self) {
        for open in &mut self.devices {
            if open.grabbed {
                let _ = open.device.ungrab();
            }
        }
    }
}
