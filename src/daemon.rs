//! The outer accept/session cycle.
//!
//! ```text
//! initialize endpoint -> accept client -> read configuration
//!     -> create virtual device + grab devices -> translation loop
//!     -> tear down -> close endpoint -> (repeat)
//! ```
//!
//! Every session owns its own endpoint, stage, grabs and virtual device.
//! A session ending for any runtime reason sends the daemon back to the
//! top of the cycle; only fatal startup failures are returned as errors.

use crate::config::Settings;
use crate::device::{GrabbedDevices, VirtualOutput};
use crate::error::Result;
use crate::filter::GrabFilters;
use crate::ipc::IpcServer;
use crate::logging::Logger;
use crate::stage::Stage;
use crate::translate::{SessionEnd, Translator, run_session};
use crate::{log_error, verbose};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Pause before accepting again after devices failed to open.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep for `delay`, returning early once `shutdown` is raised.
fn pause(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    while !shutdown.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(SHUTDOWN_POLL_INTERVAL));
    }
}

/// Run the daemon with the platform backend until `shutdown` is raised.
pub fn run<S: Stage>(settings: &Settings, shutdown: &AtomicBool, log: &Logger) -> Result<()> {
    run_with::<S, _, _, _>(settings, shutdown, log, |filters| {
        crate::platform::open_devices(&settings.identity, filters)
    })
}

/// Run the daemon, creating the per-session devices with `open`.
///
/// `open` receives the client's grab filters and returns the grabbed
/// devices together with the virtual output. A fatal error from `open`
/// ends the daemon; any other drops the client and is retried with the
/// next one after [`RECONNECT_DELAY`].
pub fn run_with<S, G, O, F>(
    settings: &Settings,
    shutdown: &AtomicBool,
    log: &Logger,
    mut open: F,
) -> Result<()>
where
    S: Stage,
    G: GrabbedDevices,
    O: VirtualOutput,
    F: FnMut(GrabFilters) -> Result<(G, O)>,
{
    while !shutdown.load(Ordering::SeqCst) {
        let server = IpcServer::initialize(&settings.ipc_path)?;
        verbose!(log, "waiting for client on {}", settings.ipc_path.display());

        let Some(mut session) = server.accept(shutdown)? else {
            break;
        };
        verbose!(log, "client connected");

        let (stage, filters) = match session.read_config::<S>(shutdown) {
            Ok(Some(config)) => config,
            Ok(None) => {
                verbose!(log, "no configuration received");
                continue;
            }
            Err(e) => {
                log_error!(log, "reading configuration failed: {e}");
                continue;
            }
        };
        verbose!(log, "configuration received");

        let (mut devices, mut output) = match open(filters) {
            Ok(opened) => opened,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log_error!(log, "opening devices failed: {e}");
                drop(session);
                server.shutdown();
                pause(RECONNECT_DELAY, shutdown);
                continue;
            }
        };
        verbose!(log, "devices grabbed");

        let mut translator = Translator::new(stage);
        let end = run_session(
            &mut translator,
            &mut session,
            &mut devices,
            &mut output,
            shutdown,
            log,
        );
        match &end {
            SessionEnd::DeviceLost(e) | SessionEnd::OutputFailed(e) | SessionEnd::Protocol(e) => {
                log_error!(log, "session ended: {e}")
            }
            SessionEnd::Disconnected => verbose!(log, "session ended: client disconnected"),
            SessionEnd::Shutdown => verbose!(log, "session ended: shutting down"),
        }

        drop(session);
        server.shutdown();
        // physical devices go back to the OS before the virtual one vanishes
        drop(devices);
        drop(output);
        verbose!(log, "session torn down");
    }
    Ok(())
}
