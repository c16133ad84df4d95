//! Windows transport: named-pipe client, payload mapping, DLL injection.

mod pipe;
mod process;

pub use pipe::{PipeConnector, PipeTransport};
pub use process::{inject_library, read_current_payload, SharedMemoryCopier, PAYLOAD_MAPPING_PREFIX};

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};

use crate::error::TransportError;

/// NUL-terminated UTF-16 copy of `s`.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Read a NUL-terminated UTF-16 string.
///
/// # Safety
/// `p` must be null or point to a NUL-terminated UTF-16 buffer.
pub unsafe fn from_wide_ptr(p: *const u16) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let mut len = 0;
    while *p.add(len) != 0 {
        len += 1;
    }
    Some(String::from_utf16_lossy(std::slice::from_raw_parts(p, len)))
}

/// Read a NUL-terminated ANSI string (lossy).
///
/// # Safety
/// `p` must be null or point to a NUL-terminated byte buffer.
pub unsafe fn from_ansi_ptr(p: *const u8) -> Option<String> {
    if p.is_null() {
        return None;
    }
    let s = std::ffi::CStr::from_ptr(p.cast());
    Some(s.to_string_lossy().into_owned())
}

pub(crate) fn win32_error(op: &'static str) -> TransportError {
    // SAFETY: reads the calling thread's last-error value.
    let code = unsafe { GetLastError() };
    TransportError::Win32 { op, code }
}

/// Closes the wrapped handle on drop.
pub(crate) struct HandleGuard(pub HANDLE);

impl HandleGuard {
    pub fn is_valid(&self) -> bool {
        self.0 != 0 && self.0 != INVALID_HANDLE_VALUE
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if self.is_valid() {
            // SAFETY: the guard owns the handle.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}
