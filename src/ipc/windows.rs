//! Named pipe transport.
//!
//! The listening instance is created in `PIPE_NOWAIT` mode so a pending
//! accept can be polled against the shutdown flag. A connected instance is
//! switched to blocking mode, and reads only take the bytes
//! `PeekNamedPipe` reports as available.

use super::Channel;
use std::cell::Cell;
use std::ffi::c_void;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_NO_DATA, ERROR_PIPE_CONNECTED, ERROR_PIPE_LISTENING,
    HANDLE, WIN32_ERROR,
};
use windows::Win32::Storage::FileSystem::{PIPE_ACCESS_DUPLEX, ReadFile};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, NAMED_PIPE_MODE, PIPE_NOWAIT,
    PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT, PeekNamedPipe, SetNamedPipeHandleState,
};
use windows::core::PCWSTR;

const BUFFER_SIZE: u32 = 64 * 1024;

/// Client-side stream; named pipes open like files.
pub struct ClientStream(File);

impl ClientStream {
    pub fn connect(path: &Path) -> io::Result<Self> {
        File::options()
            .read(true)
            .write(true)
            .open(path)
            .map(ClientStream)
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

fn to_io_error(e: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(e.code().0 & 0xFFFF)
}

fn is_win32(e: &windows::core::Error, code: WIN32_ERROR) -> bool {
    e.code() == code.to_hresult()
}

/// Listening pipe endpoint.
pub struct Listener {
    name: Vec<u16>,
    pending: Cell<Option<HANDLE>>,
}

impl Listener {
    pub fn bind(path: &Path) -> io::Result<Self> {
        let name: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let listener = Self {
            name,
            pending: Cell::new(None),
        };
        listener.pending.set(Some(listener.create_instance()?));
        Ok(listener)
    }

    fn create_instance(&self) -> io::Result<HANDLE> {
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR(self.name.as_ptr()),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_NOWAIT,
                1,
                BUFFER_SIZE,
                BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(io::Error::last_os_error());
        }
        Ok(handle)
    }

    pub fn try_accept(&self) -> io::Result<Option<Connection>> {
        let handle = match self.pending.get() {
            Some(handle) => handle,
            None => {
                let handle = self.create_instance()?;
                self.pending.set(Some(handle));
                handle
            }
        };

        match unsafe { ConnectNamedPipe(handle, None) } {
            Ok(()) => {}
            Err(e) if is_win32(&e, ERROR_PIPE_CONNECTED) => {}
            Err(e) if is_win32(&e, ERROR_PIPE_LISTENING) => return Ok(None),
            Err(e) if is_win32(&e, ERROR_NO_DATA) => {
                // client came and went; recycle the instance
                unsafe {
                    let _ = DisconnectNamedPipe(handle);
                }
                return Ok(None);
            }
            Err(e) => return Err(to_io_error(e)),
        }

        let mode: NAMED_PIPE_MODE = PIPE_READMODE_BYTE | PIPE_WAIT;
        unsafe { SetNamedPipeHandleState(handle, Some(&mode as *const NAMED_PIPE_MODE), None, None) }
            .map_err(to_io_error)?;
        self.pending.set(None);
        Ok(Some(Connection { handle }))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            unsafe {
                let _ = CloseHandle(handle);
            }
        }
    }
}

/// One connected client.
pub struct Connection {
    handle: HANDLE,
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0u32;
        match unsafe { ReadFile(self.handle, Some(buf), Some(&mut read as *mut u32), None) } {
            Ok(()) => Ok(read as usize),
            Err(e) if is_win32(&e, ERROR_BROKEN_PIPE) => Ok(0),
            Err(e) => Err(to_io_error(e)),
        }
    }
}

impl Channel for Connection {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut available = 0u32;
        match unsafe {
            PeekNamedPipe(
                self.handle,
                None::<*mut c_void>,
                0,
                None,
                Some(&mut available as *mut u32),
                None,
            )
        } {
            Ok(()) if available == 0 => Ok(None),
            Ok(()) => {
                let len = buf.len().min(available as usize);
                self.read(&mut buf[..len]).map(Some)
            }
            Err(e) if is_win32(&e, ERROR_BROKEN_PIPE) => Ok(Some(0)),
            Err(e) => Err(to_io_error(e)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            let _ = DisconnectNamedPipe(self.handle);
            let _ = CloseHandle(self.handle);
        }
    }
}
