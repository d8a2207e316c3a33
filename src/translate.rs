//! The event translation loop.
//!
//! One session runs single-threaded: read a raw device event, let the
//! stage translate it, write the result to the virtual device. Output is
//! sent in exactly the order the stage returned it. The only exceptions are
//! the two explicit rules around [`KeyState::OutputOnRelease`]:
//!
//! - everything from the sentinel onward is *deferred* and sent before the
//!   next key event is processed (normally the release of the triggering
//!   key);
//! - OS auto-repeats arriving while output is deferred are *suppressed*, so
//!   deferred output is never duplicated.
//!
//! Configuration updates are only taken while the stage reports no output
//! key held and nothing is deferred, so a swap never strands a key in the
//! pressed state.

use crate::device::{GrabbedDevices, READ_TIMEOUT, VirtualOutput};
use crate::error::{Error, Result};
use crate::event::{InputEvent, KeySequence, KeyState};
use crate::ipc::{Channel, IpcSession, PollOutcome};
use crate::logging::Logger;
use crate::stage::Stage;
use crate::verbose;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-session translation state around a stage.
pub struct Translator<S: Stage> {
    stage: S,
    deferred: KeySequence,
}

impl<S: Stage> Translator<S> {
    /// Wrap a configured stage.
    pub fn new(stage: S) -> Self {
        Self {
            stage,
            deferred: KeySequence::new(),
        }
    }

    /// The wrapped stage.
    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// The wrapped stage, for configuration updates.
    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    /// Output withheld until the triggering key is released.
    pub fn deferred(&self) -> &[crate::event::KeyEvent] {
        &self.deferred
    }

    /// Whether a configuration swap is safe right now.
    pub fn can_swap_config(&self) -> bool {
        self.deferred.is_empty() && !self.stage.is_output_down()
    }

    /// Process one raw input event.
    pub fn process<O: VirtualOutput>(&mut self, input: InputEvent, output: &mut O) -> Result<()> {
        match input {
            InputEvent::Sync => Ok(()),
            InputEvent::Passthrough(raw) => {
                output.send_event(&raw)?;
                output.flush()
            }
            InputEvent::Key { event, repeat } => {
                if !self.deferred.is_empty() {
                    if repeat {
                        return Ok(());
                    }
                    for deferred in self.deferred.iter().filter(|e| !e.is_output_on_release()) {
                        output.send_key_event(deferred)?;
                    }
                }

                let previous = std::mem::take(&mut self.deferred);
                self.stage.reuse_buffer(previous);
                let mut sequence = self.stage.apply_input(event);

                let split = sequence
                    .iter()
                    .position(|e| e.state == KeyState::OutputOnRelease)
                    .unwrap_or(sequence.len());
                for event in &sequence[..split] {
                    output.send_key_event(event)?;
                }
                output.flush()?;

                sequence.drain(..split);
                self.deferred = sequence;
                Ok(())
            }
        }
    }
}

/// Why a session ended. Every variant is recoverable.
#[derive(Debug)]
pub enum SessionEnd {
    /// Reading from the grabbed devices failed or the grab was lost.
    DeviceLost(Error),
    /// Writing to the virtual device failed.
    OutputFailed(Error),
    /// The client closed the connection.
    Disconnected,
    /// The client sent something unusable.
    Protocol(Error),
    /// The shutdown flag was raised.
    Shutdown,
}

/// Run the translation loop until the session ends.
pub fn run_session<S, T, G, O>(
    translator: &mut Translator<S>,
    ipc: &mut IpcSession<T>,
    devices: &mut G,
    output: &mut O,
    shutdown: &AtomicBool,
    log: &Logger,
) -> SessionEnd
where
    S: Stage,
    T: Channel,
    G: GrabbedDevices,
    O: VirtualOutput,
{
    verbose!(log, "entering update loop");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return SessionEnd::Shutdown;
        }

        let input = match devices.read_event(READ_TIMEOUT) {
            Ok(input) => input,
            Err(e) => {
                verbose!(log, "reading device event failed: {e}");
                return SessionEnd::DeviceLost(e);
            }
        };

        if translator.can_swap_config() {
            match ipc.poll_update(translator.stage_mut()) {
                Ok(PollOutcome::Unchanged) => {}
                Ok(PollOutcome::Updated(filters)) => {
                    verbose!(log, "configuration updated");
                    if let Err(e) = devices.set_grab_filters(filters) {
                        verbose!(log, "applying grab filters failed: {e}");
                        return SessionEnd::DeviceLost(e);
                    }
                }
                Ok(PollOutcome::Disconnected) => {
                    verbose!(log, "connection to client reset");
                    return SessionEnd::Disconnected;
                }
                Err(e) => {
                    verbose!(log, "receiving configuration update failed: {e}");
                    return SessionEnd::Protocol(e);
                }
            }
        }

        if let Some(input) = input
            && let Err(e) = translator.process(input, output)
        {
            verbose!(log, "sending to virtual device failed: {e}");
            return SessionEnd::OutputFailed(e);
        }
    }
}
