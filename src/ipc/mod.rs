//! Single-client control channel.
//!
//! A client connects to the well-known endpoint, sends one full
//! [`Configuration`] and may then send any number of replacement
//! configurations while the session runs. The server serves exactly one
//! client at a time: accept, run the session, tear down, accept again.
//!
//! ## Wire format
//!
//! Each message is a frame (see [`frame`]) whose payload is the JSON
//! encoding of a [`Configuration`].

pub mod frame;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use self::unix as transport;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as transport;

pub use transport::Connection;

use crate::error::{Error, Result};
use crate::filter::GrabFilters;
use crate::stage::Stage;
use frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a pending accept checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the first-configuration read polls a silent client.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One message from the client: grab filters plus the stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration<C> {
    /// Which devices to grab.
    pub grab_filters: GrabFilters,
    /// Opaque configuration of the remap stage.
    pub stage: C,
}

/// Result of a non-blocking update poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing new.
    Unchanged,
    /// The stage configuration was replaced; these are the new filters.
    Updated(GrabFilters),
    /// The client closed the connection.
    Disconnected,
}

/// A byte stream read without blocking.
pub trait Channel {
    /// Read whatever is available without blocking.
    ///
    /// Returns `Ok(None)` when no data is pending and `Ok(Some(0))` when the
    /// peer closed the connection.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// One connected client.
pub struct IpcSession<T: Channel> {
    channel: T,
    decoder: FrameDecoder,
}

impl<T: Channel> IpcSession<T> {
    /// Wrap a connected channel.
    pub fn new(channel: T) -> Self {
        Self {
            channel,
            decoder: FrameDecoder::new(),
        }
    }

    /// Wait until the client delivers its first full configuration.
    ///
    /// Returns `Ok(None)` when the client closes without sending one or
    /// `shutdown` is raised first.
    pub fn read_config<S: Stage>(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<Option<(S, GrabFilters)>> {
        let Some(payload) = self.read_frame(shutdown)? else {
            return Ok(None);
        };
        let config: Configuration<S::Config> = serde_json::from_slice(&payload)?;
        let stage = S::from_config(config.stage)?;
        Ok(Some((stage, config.grab_filters)))
    }

    /// Check for a replacement configuration without blocking.
    ///
    /// A received configuration is applied to `stage` before returning
    /// [`PollOutcome::Updated`]. Malformed frames are errors.
    pub fn poll_update<S: Stage>(&mut self, stage: &mut S) -> Result<PollOutcome> {
        let mut buf = [0u8; 4096];
        loop {
            match self.channel.try_read(&mut buf) {
                Ok(Some(0)) => return Ok(PollOutcome::Disconnected),
                Ok(Some(n)) => self.decoder.push(&buf[..n]),
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(PollOutcome::Disconnected);
                }
                Err(e) => return Err(e.into()),
            }
        }

        // only the most recent complete configuration matters
        let mut latest = None;
        while let Some(payload) = self.decoder.next_frame()? {
            latest = Some(payload);
        }
        let Some(payload) = latest else {
            return Ok(PollOutcome::Unchanged);
        };
        let config: Configuration<S::Config> = serde_json::from_slice(&payload)?;
        stage.set_config(config.stage)?;
        Ok(PollOutcome::Updated(config.grab_filters))
    }

    fn read_frame(&mut self, shutdown: &AtomicBool) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(Some(payload));
            }
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.channel.try_read(&mut buf) {
                Ok(Some(0)) if self.decoder.has_partial() => {
                    return Err(Error::Protocol("connection closed mid-frame".into()));
                }
                Ok(Some(0)) => return Ok(None),
                Ok(Some(n)) => self.decoder.push(&buf[..n]),
                Ok(None) => std::thread::sleep(READ_POLL_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The listening control endpoint.
pub struct IpcServer {
    listener: transport::Listener,
}

impl IpcServer {
    /// Create the endpoint at `path`.
    pub fn initialize(path: &Path) -> Result<Self> {
        let listener = transport::Listener::bind(path).map_err(|source| Error::Endpoint {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { listener })
    }

    /// Wait for the next client.
    ///
    /// Blocks until a client connects; returns `Ok(None)` if `shutdown` is
    /// raised first.
    pub fn accept(&self, shutdown: &AtomicBool) -> Result<Option<IpcSession<Connection>>> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.listener.try_accept()? {
                Some(connection) => return Ok(Some(IpcSession::new(connection))),
                None => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            }
        }
    }

    /// Close the endpoint.
    pub fn shutdown(self) {
        drop(self);
    }
}

/// Client side of the control channel.
pub struct IpcClient {
    stream: transport::ClientStream,
}

impl IpcClient {
    /// Connect to the daemon listening at `path`.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = transport::ClientStream::connect(path).map_err(|source| Error::Endpoint {
            path: PathBuf::from(path),
            source,
        })?;
        Ok(Self { stream })
    }

    /// Send a full configuration.
    pub fn send<C: Serialize>(&mut self, config: &Configuration<C>) -> Result<()> {
        let payload = serde_json::to_vec(config).map_err(|e| Error::Config(e.to_string()))?;
        self.stream.write_all(&frame::encode(&payload)?)?;
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::GrabPolicy;
    use crate::keycode::Key;
    use crate::stage::{Mapping, MappingConfig, MappingStage};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    /// Client that connected and never writes.
    struct SilentChannel;

    impl Channel for SilentChannel {
        fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(None)
        }
    }

    /// Channel fed from a list of chunks; `None` entries mean "would block".
    struct ScriptedChannel {
        chunks: VecDeque<Option<Vec<u8>>>,
    }

    impl ScriptedChannel {
        fn new(chunks: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                chunks: chunks.into(),
            }
        }
    }

    impl Channel for ScriptedChannel {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            match self.chunks.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(Some(chunk.len()))
                }
                Some(None) => Ok(None),
                None => Ok(Some(0)),
            }
        }
    }

    fn running() -> AtomicBool {
        AtomicBool::new(false)
    }

    fn config_frame(policy: GrabPolicy, input: u16) -> Vec<u8> {
        let config = Configuration {
            grab_filters: GrabFilters::with_default(policy),
            stage: MappingConfig {
                mappings: vec![Mapping {
                    input: Key(input),
                    output: vec![],
                }],
            },
        };
        frame::encode(&serde_json::to_vec(&config).unwrap()).unwrap()
    }

    #[test]
    fn test_read_config_returns_stage_and_filters() {
        let bytes = config_frame(GrabPolicy::Grab, 30);
        let (head, tail) = bytes.split_at(7);
        let mut session = IpcSession::new(ScriptedChannel::new(vec![
            Some(head.to_vec()),
            Some(tail.to_vec()),
        ]));

        let (_stage, filters) = session.read_config::<MappingStage>(&running()).unwrap().unwrap();
        assert_eq!(filters.default_policy, GrabPolicy::Grab);
    }

    #[test]
    fn test_read_config_none_when_client_closes() {
        let mut session = IpcSession::new(ScriptedChannel::new(vec![]));
        assert!(session.read_config::<MappingStage>(&running()).unwrap().is_none());
    }

    #[test]
    fn test_read_config_waits_through_idle_reads() {
        let mut session = IpcSession::new(ScriptedChannel::new(vec![
            None,
            None,
            Some(config_frame(GrabPolicy::Ignore, 30)),
        ]));
        let (_stage, filters) = session.read_config::<MappingStage>(&running()).unwrap().unwrap();
        assert_eq!(filters.default_policy, GrabPolicy::Ignore);
    }

    #[test]
    fn test_read_config_observes_shutdown_with_silent_client() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let raiser = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                shutdown.store(true, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        let mut session = IpcSession::new(SilentChannel);
        assert!(session.read_config::<MappingStage>(&shutdown).unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        raiser.join().unwrap();
    }

    #[test]
    fn test_read_config_rejects_missing_default_policy() {
        let payload = br#"{"grab_filters":{"rules":[]},"stage":{"mappings":[]}}"#;
        let mut session =
            IpcSession::new(ScriptedChannel::new(vec![Some(frame::encode(payload).unwrap())]));
        assert!(matches!(
            session.read_config::<MappingStage>(&running()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_poll_update_sequence() {
        let mut session = IpcSession::new(ScriptedChannel::new(vec![
            Some(config_frame(GrabPolicy::Grab, 30)),
            None,
            Some(config_frame(GrabPolicy::Ignore, 31)),
            None,
        ]));
        let (mut stage, _) = session.read_config::<MappingStage>(&running()).unwrap().unwrap();

        assert_eq!(session.poll_update(&mut stage).unwrap(), PollOutcome::Unchanged);
        assert_eq!(
            session.poll_update(&mut stage).unwrap(),
            PollOutcome::Updated(GrabFilters::with_default(GrabPolicy::Ignore))
        );
        assert_eq!(
            session.poll_update(&mut stage).unwrap(),
            PollOutcome::Disconnected
        );
    }

    #[test]
    fn test_poll_update_waits_for_complete_frame() {
        let bytes = config_frame(GrabPolicy::Ignore, 31);
        let (head, tail) = bytes.split_at(10);
        let mut session = IpcSession::new(ScriptedChannel::new(vec![
            Some(config_frame(GrabPolicy::Grab, 30)),
            Some(head.to_vec()),
            None,
            Some(tail.to_vec()),
            None,
        ]));
        let (mut stage, _) = session.read_config::<MappingStage>(&running()).unwrap().unwrap();

        assert_eq!(session.poll_update(&mut stage).unwrap(), PollOutcome::Unchanged);
        assert!(matches!(
            session.poll_update(&mut stage).unwrap(),
            PollOutcome::Updated(_)
        ));
    }
}
