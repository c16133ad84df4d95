//! Getting the hooks DLL and the payload into a suspended child.
//!
//! The payload travels in a named section `Local\iodetour-payload-{pid}`.
//! The parent duplicates its mapping handle into the child, so the section
//! outlives the parent's own handle, and records the duplicated value in
//! the block so the child can release it after reading.

use std::mem::offset_of;
use std::path::Path;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, DuplicateHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualAllocEx,
    MEMORY_MAPPED_VIEW_ADDRESS,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentProcessId, QueueUserAPC};

use super::{to_wide, win32_error, HandleGuard};
use crate::channel::{ChildTarget, PayloadCopier};
use crate::error::TransportError;
use crate::payload::{Payload, PayloadBlock};

pub const PAYLOAD_MAPPING_PREFIX: &str = r"Local\iodetour-payload-";

const PAGE_READWRITE: u32 = 0x04;
const FILE_MAP_WRITE: u32 = 0x02;
const FILE_MAP_READ: u32 = 0x04;
const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const DUPLICATE_SAME_ACCESS: u32 = 0x2;

fn mapping_name(pid: u32) -> Vec<u16> {
    to_wide(&format!("{PAYLOAD_MAPPING_PREFIX}{pid}"))
}

struct ViewGuard(MEMORY_MAPPED_VIEW_ADDRESS);

impl Drop for ViewGuard {
    fn drop(&mut self) {
        // SAFETY: the guard owns the view.
        unsafe {
            UnmapViewOfFile(self.0);
        }
    }
}

/// Queue `LoadLibraryW(dll_path)` on a suspended thread of `process`.
///
/// The APC runs when the thread is resumed, before the image entry point.
/// The remote path buffer is left allocated; the loader reads it after
/// this function returns.
pub fn inject_library(process: HANDLE, thread: HANDLE, dll_path: &Path) -> Result<(), TransportError> {
    let path = to_wide(&dll_path.to_string_lossy());
    let bytes = path.len() * std::mem::size_of::<u16>();

    // SAFETY: plain Win32 calls on handles owned by the caller; every
    // pointer passed describes a live local buffer.
    unsafe {
        let remote = VirtualAllocEx(
            process,
            ptr::null(),
            bytes,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        );
        if remote.is_null() {
            return Err(win32_error("VirtualAllocEx"));
        }
        if WriteProcessMemory(process, remote, path.as_ptr() as _, bytes, ptr::null_mut()) == 0 {
            return Err(win32_error("WriteProcessMemory"));
        }

        let kernel32 = GetModuleHandleW(to_wide("kernel32.dll").as_ptr());
        if kernel32 == 0 {
            return Err(win32_error("GetModuleHandleW"));
        }
        let Some(load_library) = GetProcAddress(kernel32, b"LoadLibraryW\0".as_ptr()) else {
            return Err(win32_error("GetProcAddress"));
        };
        let apc: unsafe extern "system" fn(usize) = std::mem::transmute(load_library);
        if QueueUserAPC(Some(apc), thread, remote as usize) == 0 {
            return Err(win32_error("QueueUserAPC"));
        }
    }
    Ok(())
}

/// Copies payload blocks through a named section per child.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedMemoryCopier;

impl PayloadCopier for SharedMemoryCopier {
    fn copy_payload(&self, target: &ChildTarget, block: &PayloadBlock) -> Result<(), TransportError> {
        let name = mapping_name(target.process_id);
        // SAFETY: the view is PayloadBlock::SIZE bytes and written only
        // through the raw pointer below; handles are closed by guards.
        unsafe {
            let mapping = HandleGuard(CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                0,
                PayloadBlock::SIZE as u32,
                name.as_ptr(),
            ));
            if !mapping.is_valid() {
                return Err(win32_error("CreateFileMappingW"));
            }
            let view = MapViewOfFile(mapping.0, FILE_MAP_WRITE, 0, 0, PayloadBlock::SIZE);
            if view.Value.is_null() {
                return Err(win32_error("MapViewOfFile"));
            }
            let view = ViewGuard(view);
            let base = view.0.Value as *mut u8;
            ptr::copy_nonoverlapping(block.as_bytes().as_ptr(), base, PayloadBlock::SIZE);

            let mut remote: HANDLE = 0;
            if DuplicateHandle(
                GetCurrentProcess(),
                mapping.0,
                target.process_handle as HANDLE,
                ptr::addr_of_mut!(remote),
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            ) == 0
            {
                return Err(win32_error("DuplicateHandle"));
            }
            let field = base.add(offset_of!(PayloadBlock, transport_handle)) as *mut u64;
            field.write_unaligned(remote as u64);
        }
        Ok(())
    }
}

/// Read and release the payload the parent left for this process.
pub fn read_current_payload() -> Result<Payload, TransportError> {
    // SAFETY: the section is opened read-only and copied out before the
    // view is unmapped.
    let block = unsafe {
        let name = mapping_name(GetCurrentProcessId());
        let mapping = HandleGuard(OpenFileMappingW(FILE_MAP_READ, 0, name.as_ptr()));
        if !mapping.is_valid() {
            return Err(win32_error("OpenFileMappingW"));
        }
        let view = MapViewOfFile(mapping.0, FILE_MAP_READ, 0, 0, PayloadBlock::SIZE);
        if view.Value.is_null() {
            return Err(win32_error("MapViewOfFile"));
        }
        let view = ViewGuard(view);
        let bytes = std::slice::from_raw_parts(view.0.Value as *const u8, PayloadBlock::SIZE);
        PayloadBlock::from_bytes(bytes)?
    };

    if block.transport_handle != 0 {
        // SAFETY: the parent duplicated this handle for us and nothing else
        // refers to it.
        unsafe {
            CloseHandle(block.transport_handle as HANDLE);
        }
    }
    Ok(Payload::from_block(&block)?)
}
