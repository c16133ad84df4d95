//! Client end of the trace pipe.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, WriteFile};
use windows_sys::Win32::System::Pipes::{SetNamedPipeHandleState, WaitNamedPipeW};

use super::to_wide;
use crate::channel::{Connector, Transport};

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const OPEN_EXISTING: u32 = 3;
const PIPE_READMODE_MESSAGE: u32 = 0x0000_0002;

/// Connects to the launcher's message-mode pipe.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeConnector;

impl Connector for PipeConnector {
    type Transport = PipeTransport;

    fn try_connect(&self, pipe: &str) -> io::Result<PipeTransport> {
        let name = to_wide(pipe);
        // SAFETY: `name` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileW(
                name.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                0,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let transport = PipeTransport { handle };
        let mut mode = PIPE_READMODE_MESSAGE;
        // SAFETY: valid pipe handle; optional arguments are null.
        let ok = unsafe {
            SetNamedPipeHandleState(
                handle,
                ptr::addr_of_mut!(mode),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(transport)
    }

    fn wait_available(&self, pipe: &str, timeout_ms: u32) -> bool {
        let name = to_wide(pipe);
        // SAFETY: `name` is NUL-terminated.
        unsafe { WaitNamedPipeW(name.as_ptr(), timeout_ms) != 0 }
    }
}

/// Owned pipe handle; one `WriteFile` per message.
#[derive(Debug)]
pub struct PipeTransport {
    handle: HANDLE,
}

impl Transport for PipeTransport {
    fn write_message(&mut self, message: &[u8]) -> io::Result<()> {
        let mut written = 0u32;
        // SAFETY: buffer and length describe `message`; synchronous write.
        let ok = unsafe {
            WriteFile(
                self.handle,
                message.as_ptr() as _,
                message.len() as u32,
                ptr::addr_of_mut!(written),
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        if written as usize != message.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write on message pipe",
            ));
        }
        Ok(())
    }
}

impl Drop for PipeTransport {
    fn drop(&mut self) {
        // SAFETY: the transport owns the handle.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}
