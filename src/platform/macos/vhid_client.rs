//! Client of the Karabiner DriverKit virtual HID service.
//!
//! Reports are posted as datagrams to the service's server socket. A
//! receiver thread turns the service's responses into [`ServiceSignal`]s
//! and sends heartbeats; the owner applies the signals through a
//! [`Connection`].

use crate::device::{DeviceIdentity, VirtualOutput};
use crate::error::{Error, Result};
use crate::event::{KeyEvent, RawEvent};
use crate::vhid::{
    Command, Connection, ConnectionState, ReportKind, ReportState, Request, ServiceSignal,
    decode_response, encode_heartbeat, encode_request, keyboard_parameters,
};
use std::fs;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SERVER_DIR: &str = "/Library/Application Support/org.pqrs/tmp/rootonly/vhidd_server";
const CLIENT_DIR: &str = "/Library/Application Support/org.pqrs/tmp/rootonly/vhidd_client";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPTS: u32 = 30;
const CLOSE_ATTEMPTS: u32 = 20;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 1024;

/// Newest server socket; the service names them by creation time.
fn server_socket(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sock"))
        .max()
}

fn receive_loop(socket: Arc<UnixDatagram>, signals: Sender<ServiceSignal>, stop: Arc<AtomicBool>) {
    let mut buffer = [0u8; MAX_DATAGRAM];
    let mut last_heartbeat: Option<Instant> = None;
    while !stop.load(Ordering::Acquire) {
        if last_heartbeat.is_none_or(|at| at.elapsed() >= HEARTBEAT_INTERVAL) {
            let _ = socket.send(&encode_heartbeat(HEARTBEAT_DEADLINE));
            last_heartbeat = Some(Instant::now());
        }
        match socket.recv(&mut buffer) {
            Ok(len) => {
                if let Some(signal) = decode_response(&buffer[..len]) {
                    if signals.send(signal).is_err() {
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = signals.send(ServiceSignal::Error(e.to_string()));
                return;
            }
        }
    }
    let _ = signals.send(ServiceSignal::Closed);
}

/// The virtual keyboard of one session.
pub struct VirtualHidKeyboard {
    socket: Arc<UnixDatagram>,
    client_path: PathBuf,
    connection: Connection,
    reports: ReportState,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl VirtualHidKeyboard {
    /// Connect to the service and wait until the virtual keyboard is ready.
    pub fn create(identity: &DeviceIdentity) -> Result<Self> {
        let server = server_socket(Path::new(SERVER_DIR)).ok_or_else(|| {
            Error::DriverUnavailable(
                "Karabiner virtual HID service is not running. Install \
                 Karabiner-DriverKit-VirtualHIDDevice and activate it."
                    .into(),
            )
        })?;

        let client_path = Path::new(CLIENT_DIR).join(format!("{:x}.sock", std::process::id()));
        let _ = fs::remove_file(&client_path);
        let socket = UnixDatagram::bind(&client_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(format!(
                "cannot bind {}: {e}. The virtual HID service requires root.",
                client_path.display()
            )),
            _ => Error::Endpoint {
                path: client_path.clone(),
                source: e,
            },
        })?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let (signal_tx, signal_rx) = mpsc::channel();
        match socket.connect(&server) {
            Ok(()) => {
                let _ = signal_tx.send(ServiceSignal::Connected);
            }
            Err(e) => {
                let _ = signal_tx.send(ServiceSignal::ConnectFailed(e.to_string()));
            }
        }

        let socket = Arc::new(socket);
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = {
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("vhid-client".into())
                .spawn(move || receive_loop(socket, signal_tx, stop))
                .map_err(|e| Error::ThreadError(format!("Failed to spawn vhid receiver: {e}")))?
        };

        let mut keyboard = Self {
            socket,
            client_path,
            connection: Connection::new(signal_rx),
            reports: ReportState::new(),
            stop,
            receiver: Some(receiver),
        };

        let socket = Arc::clone(&keyboard.socket);
        let parameters = keyboard_parameters(identity.vendor_id, identity.product_id);
        let state = keyboard.connection.wait_while(
            ConnectionState::Initializing,
            CONNECT_ATTEMPTS,
            POLL_INTERVAL,
            |Command::InitializeKeyboard| {
                let request = encode_request(Request::KeyboardInitialize, &parameters);
                if let Err(e) = socket.send(&request) {
                    log::warn!("Failed to initialize virtual keyboard: {e}");
                }
            },
        );

        if keyboard.connection.version_mismatch() {
            return Err(Error::DriverVersionMismatch(
                "update Karabiner-DriverKit-VirtualHIDDevice".into(),
            ));
        }
        if state != ConnectionState::Connected {
            return Err(Error::VirtualDevice(
                "virtual HID keyboard did not become ready".into(),
            ));
        }
        log::debug!("virtual HID keyboard ready");
        Ok(keyboard)
    }

    fn post(&self, request: Request, payload: &[u8]) -> Result<()> {
        self.socket
            .send(&encode_request(request, payload))
            .map(|_| ())
            .map_err(|e| Error::SendFailed(format!("virtual HID service: {e}")))
    }

    fn post_report(&mut self, kind: Option<ReportKind>) -> Result<()> {
        self.connection.pump(|_| {});
        if self.connection.state() != ConnectionState::Connected {
            return Err(Error::SendFailed("virtual HID keyboard disconnected".into()));
        }
        match kind {
            Some(kind) => self.post(Request::from(kind), &self.reports.report(kind)),
            None => Ok(()),
        }
    }

    /// Terminate the keyboard and wait for the service to let go.
    fn close(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        if self.connection.state() == ConnectionState::Connected {
            let _ = self.post(Request::KeyboardReset, &[]);
            let _ = self.post(Request::KeyboardTerminate, &[]);
        }
        self.stop.store(true, Ordering::Release);
        self.connection.wait_while(
            ConnectionState::Connected,
            CLOSE_ATTEMPTS,
            POLL_INTERVAL,
            |_| {},
        );
        let _ = receiver.join();
        let _ = fs::remove_file(&self.client_path);
    }
}

impl VirtualOutput for VirtualHidKeyboard {
    fn send_key_event(&mut self, event: &KeyEvent) -> Result<()> {
        let kind = self.reports.apply(event);
        self.post_report(kind)
    }

    fn send_event(&mut self, event: &RawEvent) -> Result<()> {
        let kind = self.reports.apply_raw(event);
        self.post_report(kind)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for VirtualHidKeyboard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhid::PAGE_CONSUMER;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("remapd-vhid-{tag}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_newest_server_socket_is_chosen() {
        let dir = temp_dir("server");
        for name in ["1700000000.sock", "1700000005.sock", "notes.txt"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        assert_eq!(server_socket(&dir), Some(dir.join("1700000005.sock")));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_no_server_socket() {
        let dir = temp_dir("empty");
        assert_eq!(server_socket(&dir), None);
        assert_eq!(server_socket(&dir.join("missing")), None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_consumer_event_posts_consumer_report() {
        let (service, client) = UnixDatagram::pair().unwrap();
        let (tx, rx) = mpsc::channel();
        tx.send(ServiceSignal::Ready(true)).unwrap();
        let mut keyboard = VirtualHidKeyboard {
            socket: Arc::new(client),
            client_path: PathBuf::new(),
            connection: Connection::new(rx),
            reports: ReportState::new(),
            stop: Arc::new(AtomicBool::new(false)),
            receiver: None,
        };

        // mute
        keyboard
            .send_event(&RawEvent::new(PAGE_CONSUMER, 0xE2, 1))
            .unwrap();
        let mut datagram = [0u8; MAX_DATAGRAM];
        let len = service.recv(&mut datagram).unwrap();
        let report = keyboard.reports.report(ReportKind::Consumer);
        assert_eq!(
            &datagram[..len],
            &encode_request(Request::PostConsumerReport, &report)[..]
        );
        assert_eq!(&report[..3], &[2, 0xE2, 0x00]);
    }

    #[test]
    fn test_receiver_forwards_responses() {
        let (service, client) = UnixDatagram::pair().unwrap();
        client.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let client = Arc::new(client);
            thread::spawn(move || receive_loop(client, tx, stop))
        };

        let mut heartbeat = [0u8; 16];
        let len = service.recv(&mut heartbeat).unwrap();
        assert_eq!(&heartbeat[..len], &encode_heartbeat(HEARTBEAT_DEADLINE)[..]);

        service.send(&[1, 4, 1]).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            ServiceSignal::Ready(true)
        );

        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert_eq!(rx.recv().unwrap(), ServiceSignal::Closed);
    }
}
