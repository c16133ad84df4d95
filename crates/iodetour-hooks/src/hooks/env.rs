//! Entry-point hook and the CRT environment detours.
//!
//! The CRT a program uses is only known once its imports are loaded, which
//! is after `DLL_PROCESS_ATTACH`. The entry-point detour runs just before
//! the program's own startup code and binds the `getenv` family then.

use std::ffi::c_void;
use std::mem;

use iodetour_ipc::windows::{from_ansi_ptr, from_wide_ptr};
use windows_sys::Win32::Foundation::{CloseHandle, HMODULE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W, TH32CS_SNAPMODULE,
};

use super::after_call;
use crate::guard::HookGuard;
use crate::table::{attach_crt_hooks, CRT_HOOKS, ENTRY_POINT};

type EntryPointFn = unsafe extern "system" fn(*mut c_void) -> u32;
type GetenvFn = unsafe extern "C" fn(*const u8) -> *mut u8;
type WgetenvFn = unsafe extern "C" fn(*const u16) -> *mut u16;
type GetenvSFn = unsafe extern "C" fn(*mut usize, *mut u8, usize, *const u8) -> i32;
type WgetenvSFn = unsafe extern "C" fn(*mut usize, *mut u16, usize, *const u16) -> i32;

/// Preference among loaded CRTs; lower wins.
fn crt_rank(module: &str) -> Option<u8> {
    let module = module.to_ascii_lowercase();
    match module.as_str() {
        "ucrtbase.dll" => Some(0),
        "ucrtbased.dll" => Some(1),
        "msvcrt.dll" => Some(3),
        m if m.starts_with("msvcr") && m.ends_with(".dll") => Some(2),
        m if m.starts_with("api-ms-win-crt-environment-") => Some(4),
        _ => None,
    }
}

/// The preferred CRT among this process's loaded modules.
fn find_crt_module() -> Option<(String, HMODULE)> {
    // SAFETY: the snapshot handle is closed below; `entry` is a properly
    // sized MODULEENTRY32W.
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, 0);
        if snapshot == INVALID_HANDLE_VALUE {
            return None;
        }
        let mut entry: MODULEENTRY32W = mem::zeroed();
        entry.dwSize = mem::size_of::<MODULEENTRY32W>() as u32;

        let mut best: Option<(u8, String, HMODULE)> = None;
        let mut more = Module32FirstW(snapshot, &mut entry) != 0;
        while more {
            let len = entry.szModule.iter().position(|&c| c == 0).unwrap_or(entry.szModule.len());
            let name = String::from_utf16_lossy(&entry.szModule[..len]);
            if let Some(rank) = crt_rank(&name) {
                if best.as_ref().map_or(true, |(b, _, _)| rank < *b) {
                    best = Some((rank, name, entry.hModule));
                }
            }
            more = Module32NextW(snapshot, &mut entry) != 0;
        }
        CloseHandle(snapshot);
        best.map(|(_, name, module)| (name, module))
    }
}

pub(crate) unsafe extern "system" fn entry_point(peb: *mut c_void) -> u32 {
    let real: EntryPointFn = ENTRY_POINT.real();
    if let Some(_guard) = HookGuard::enter() {
        attach_crt_hooks(find_crt_module);
    }
    real(peb)
}

fn note_variable(name: Option<String>) {
    if let (Some(name), Some((ctx, _error))) = (name, after_call()) {
        ctx.registry.note_environment(&name);
    }
}

pub(crate) unsafe extern "C" fn getenv(name: *const u8) -> *mut u8 {
    let real: GetenvFn = CRT_HOOKS.getenv.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name);
    };
    let value = real(name);
    note_variable(from_ansi_ptr(name));
    value
}

pub(crate) unsafe extern "C" fn wgetenv(name: *const u16) -> *mut u16 {
    let real: WgetenvFn = CRT_HOOKS.wgetenv.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name);
    };
    let value = real(name);
    note_variable(from_wide_ptr(name));
    value
}

pub(crate) unsafe extern "C" fn getenv_s(
    required: *mut usize,
    buffer: *mut u8,
    size: usize,
    name: *const u8,
) -> i32 {
    let real: GetenvSFn = CRT_HOOKS.getenv_s.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(required, buffer, size, name);
    };
    let errno = real(required, buffer, size, name);
    note_variable(from_ansi_ptr(name));
    errno
}

pub(crate) unsafe extern "C" fn wgetenv_s(
    required: *mut usize,
    buffer: *mut u16,
    size: usize,
    name: *const u16,
) -> i32 {
    let real: WgetenvSFn = CRT_HOOKS.wgetenv_s.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(required, buffer, size, name);
    };
    let errno = real(required, buffer, size, name);
    note_variable(from_wide_ptr(name));
    errno
}
