//! Stroke injection through the Interception driver.

use super::grab::LastDevices;
use super::interception::Interception;
use crate::device::VirtualOutput;
use crate::error::{Error, Result};
use crate::event::{KeyEvent, KeyState, RawEvent};
use crate::stroke::{self, Stroke};
use std::sync::Arc;

/// Injects strokes as if they came from the last used keyboard or mouse.
pub struct InterceptionOutput {
    interception: Arc<Interception>,
    last: Arc<LastDevices>,
}

impl InterceptionOutput {
    /// Create an output sharing the driver context of the capture thread.
    pub fn new(interception: Arc<Interception>, last: Arc<LastDevices>) -> Self {
        Self { interception, last }
    }

    fn inject(&self, device: i32, stroke: Stroke) -> Result<()> {
        if device == 0 {
            log::debug!("no target device yet, dropping stroke");
            return Ok(());
        }
        if self.interception.send(device, &stroke) {
            Ok(())
        } else {
            Err(Error::SendFailed(format!("stroke to device {device} rejected")))
        }
    }
}

impl VirtualOutput for InterceptionOutput {
    fn send_key_event(&mut self, event: &KeyEvent) -> Result<()> {
        if event.key.is_mouse_button() || event.key.is_wheel() {
            // a wheel moves once per press
            if event.key.is_wheel() && event.state != KeyState::Down {
                return Ok(());
            }
            return match stroke::encode_mouse(event) {
                Some(mouse) => self.inject(self.last.mouse(), mouse.into()),
                None => Ok(()),
            };
        }
        self.inject(self.last.keyboard(), stroke::encode_key(event).into())
    }

    fn send_event(&mut self, event: &RawEvent) -> Result<()> {
        log::debug!("ignoring raw event {event:?}");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
