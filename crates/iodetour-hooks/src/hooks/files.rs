//! File, handle and directory detours.

use std::ffi::c_void;
use std::sync::Arc;

use iodetour_config::log_hooks_debug;
use iodetour_files::{Binding, OpenRequest};
use iodetour_ipc::windows::{from_ansi_ptr, from_wide_ptr};
use windows_sys::Win32::Foundation::{BOOL, ERROR_IO_PENDING, HANDLE};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentProcessId, GetProcessId};

use super::{after_call, valid_handle};
use crate::guard::HookGuard;
use crate::table::OS_HOOKS;

type CreateFileWFn =
    unsafe extern "system" fn(*const u16, u32, u32, *const c_void, u32, u32, HANDLE) -> HANDLE;
type CreateFileAFn =
    unsafe extern "system" fn(*const u8, u32, u32, *const c_void, u32, u32, HANDLE) -> HANDLE;
type ReadFileFn = unsafe extern "system" fn(HANDLE, *mut c_void, u32, *mut u32, *mut c_void) -> BOOL;
type WriteFileFn =
    unsafe extern "system" fn(HANDLE, *const c_void, u32, *mut u32, *mut c_void) -> BOOL;
type CloseHandleFn = unsafe extern "system" fn(HANDLE) -> BOOL;
type DuplicateHandleFn =
    unsafe extern "system" fn(HANDLE, HANDLE, HANDLE, *mut HANDLE, u32, BOOL, u32) -> BOOL;
type CreatePipeFn = unsafe extern "system" fn(*mut HANDLE, *mut HANDLE, *const c_void, u32) -> BOOL;
type DeleteFileWFn = unsafe extern "system" fn(*const u16) -> BOOL;
type DeleteFileAFn = unsafe extern "system" fn(*const u8) -> BOOL;
type MoveFileExWFn = unsafe extern "system" fn(*const u16, *const u16, u32) -> BOOL;
type CopyFileExWFn = unsafe extern "system" fn(
    *const u16,
    *const u16,
    *const c_void,
    *const c_void,
    *mut BOOL,
    u32,
) -> BOOL;
type CreateDirectoryWFn = unsafe extern "system" fn(*const u16, *const c_void) -> BOOL;
type RemoveDirectoryWFn = unsafe extern "system" fn(*const u16) -> BOOL;

const DUPLICATE_CLOSE_SOURCE: u32 = 0x1;
const MOVEFILE_DELAY_UNTIL_REBOOT: u32 = 0x4;

/// All anonymous pipes share one registry entry.
const ANONYMOUS_PIPE: &str = r"\\.\pipe\anonymous";

fn record_open(path: Option<String>, access: u32, disposition: u32, flags: u32, handle: HANDLE) {
    let Some(path) = path else { return };
    if let Some((ctx, _error)) = after_call() {
        let request = OpenRequest {
            desired_access: access,
            disposition,
            flags,
        };
        ctx.registry.record_open(&path, &request, valid_handle(handle));
    }
}

pub(crate) unsafe extern "system" fn create_file_w(
    name: *const u16,
    access: u32,
    share: u32,
    security: *const c_void,
    disposition: u32,
    flags: u32,
    template: HANDLE,
) -> HANDLE {
    let real: CreateFileWFn = OS_HOOKS.create_file_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name, access, share, security, disposition, flags, template);
    };
    let handle = real(name, access, share, security, disposition, flags, template);
    record_open(from_wide_ptr(name), access, disposition, flags, handle);
    handle
}

pub(crate) unsafe extern "system" fn create_file_a(
    name: *const u8,
    access: u32,
    share: u32,
    security: *const c_void,
    disposition: u32,
    flags: u32,
    template: HANDLE,
) -> HANDLE {
    let real: CreateFileAFn = OS_HOOKS.create_file_a.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name, access, share, security, disposition, flags, template);
    };
    let handle = real(name, access, share, security, disposition, flags, template);
    record_open(from_ansi_ptr(name), access, disposition, flags, handle);
    handle
}

pub(crate) unsafe extern "system" fn read_file(
    file: HANDLE,
    buffer: *mut c_void,
    len: u32,
    read: *mut u32,
    overlapped: *mut c_void,
) -> BOOL {
    let real: ReadFileFn = OS_HOOKS.read_file.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(file, buffer, len, read, overlapped);
    };
    let ok = real(file, buffer, len, read, overlapped);
    if let Some((ctx, error)) = after_call() {
        if ok != 0 || error.code() == ERROR_IO_PENDING {
            let bytes = if ok != 0 && !read.is_null() { *read } else { 0 };
            ctx.registry.set_read(file as usize, u64::from(bytes));
        }
    }
    ok
}

pub(crate) unsafe extern "system" fn write_file(
    file: HANDLE,
    buffer: *const c_void,
    len: u32,
    written: *mut u32,
    overlapped: *mut c_void,
) -> BOOL {
    let real: WriteFileFn = OS_HOOKS.write_file.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(file, buffer, len, written, overlapped);
    };
    let ok = real(file, buffer, len, written, overlapped);
    if let Some((ctx, error)) = after_call() {
        if ok != 0 || error.code() == ERROR_IO_PENDING {
            let bytes = if ok != 0 && !written.is_null() { *written } else { 0 };
            ctx.registry.set_write(file as usize, u64::from(bytes));
        }
    }
    ok
}

pub(crate) unsafe extern "system" fn close_handle(handle: HANDLE) -> BOOL {
    let real: CloseHandleFn = OS_HOOKS.close_handle.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(handle);
    };

    // Unbind first: once closed, the value can be handed out again by
    // another thread's open.
    let binding = after_call().and_then(|(ctx, _error)| ctx.registry.forget(handle as usize));
    let ok = real(handle);
    if let Some((ctx, _error)) = after_call() {
        match binding {
            Some(binding) if ok == 0 => ctx.registry.remember(handle as usize, binding),
            Some(binding) => {
                ctx.registry.closed(&binding);
                match &binding {
                    Binding::File(info) => ctx.stream(info),
                    Binding::Process(proc) => {
                        log_hooks_debug!(pid = proc.process_id, ancestry = %proc.ancestry_label, "child handle closed");
                    }
                }
            }
            None => {}
        }
    }
    ok
}

fn is_current_process(process: HANDLE) -> bool {
    // SAFETY: both calls only query the given handle.
    unsafe { process == GetCurrentProcess() || GetProcessId(process) == GetCurrentProcessId() }
}

pub(crate) unsafe extern "system" fn duplicate_handle(
    source_process: HANDLE,
    source: HANDLE,
    target_process: HANDLE,
    target: *mut HANDLE,
    access: u32,
    inherit: BOOL,
    options: u32,
) -> BOOL {
    let real: DuplicateHandleFn = OS_HOOKS.duplicate_handle.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(source_process, source, target_process, target, access, inherit, options);
    };
    let ok = real(source_process, source, target_process, target, access, inherit, options);
    if let Some((ctx, _error)) = after_call() {
        let local_source = is_current_process(source_process);
        if ok != 0 && local_source && !target.is_null() && is_current_process(target_process) {
            ctx.registry.duplicate(*target as usize, source as usize);
        }
        // The source is closed even when the duplication fails.
        if options & DUPLICATE_CLOSE_SOURCE != 0 && local_source {
            if let Some(binding) = ctx.registry.forget(source as usize) {
                ctx.registry.closed(&binding);
                if let Binding::File(info) = &binding {
                    ctx.stream(info);
                }
            }
        }
    }
    ok
}

pub(crate) unsafe extern "system" fn create_pipe(
    read: *mut HANDLE,
    write: *mut HANDLE,
    security: *const c_void,
    size: u32,
) -> BOOL {
    let real: CreatePipeFn = OS_HOOKS.create_pipe.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(read, write, security, size);
    };
    let ok = real(read, write, security, size);
    if let Some((ctx, _error)) = after_call() {
        if ok != 0 && !read.is_null() && !write.is_null() {
            let info = ctx.registry.find_or_create(ANONYMOUS_PIPE);
            ctx.registry.remember_file(*read as usize, Arc::clone(&info));
            ctx.registry.remember_file(*write as usize, info);
        }
    }
    ok
}

pub(crate) unsafe extern "system" fn delete_file_w(name: *const u16) -> BOOL {
    let real: DeleteFileWFn = OS_HOOKS.delete_file_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name);
    };
    let ok = real(name);
    if let (true, Some(path), Some((ctx, _error))) = (ok != 0, from_wide_ptr(name), after_call()) {
        ctx.stream(&ctx.registry.note_delete(&path));
    }
    ok
}

pub(crate) unsafe extern "system" fn delete_file_a(name: *const u8) -> BOOL {
    let real: DeleteFileAFn = OS_HOOKS.delete_file_a.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name);
    };
    let ok = real(name);
    if let (true, Some(path), Some((ctx, _error))) = (ok != 0, from_ansi_ptr(name), after_call()) {
        ctx.stream(&ctx.registry.note_delete(&path));
    }
    ok
}

pub(crate) unsafe extern "system" fn move_file_ex_w(
    existing: *const u16,
    new: *const u16,
    flags: u32,
) -> BOOL {
    let real: MoveFileExWFn = OS_HOOKS.move_file_ex_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(existing, new, flags);
    };
    let ok = real(existing, new, flags);
    if ok == 0 {
        return ok;
    }
    if let (Some(source), Some((ctx, _error))) = (from_wide_ptr(existing), after_call()) {
        match from_wide_ptr(new) {
            Some(dest) if flags & MOVEFILE_DELAY_UNTIL_REBOOT == 0 => {
                ctx.registry.mark_absorbed(&source);
                ctx.stream(&ctx.registry.note_write(&dest));
            }
            Some(_) => {}
            None => {
                ctx.stream(&ctx.registry.note_delete(&source));
            }
        }
    }
    ok
}

unsafe fn record_copy(existing: *const u16, new: *const u16) {
    if let (Some(source), Some(dest), Some((ctx, _error))) =
        (from_wide_ptr(existing), from_wide_ptr(new), after_call())
    {
        ctx.stream(&ctx.registry.note_read(&source));
        ctx.stream(&ctx.registry.note_write(&dest));
    }
}

pub(crate) unsafe extern "system" fn copy_file_ex_w(
    existing: *const u16,
    new: *const u16,
    progress: *const c_void,
    data: *const c_void,
    cancel: *mut BOOL,
    flags: u32,
) -> BOOL {
    let real: CopyFileExWFn = OS_HOOKS.copy_file_ex_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(existing, new, progress, data, cancel, flags);
    };
    let ok = real(existing, new, progress, data, cancel, flags);
    if ok != 0 {
        record_copy(existing, new);
    }
    ok
}

/// Undocumented sibling of `CopyFileExW` used by some tools; same signature.
pub(crate) unsafe extern "system" fn priv_copy_file_ex_w(
    existing: *const u16,
    new: *const u16,
    progress: *const c_void,
    data: *const c_void,
    cancel: *mut BOOL,
    flags: u32,
) -> BOOL {
    let real: CopyFileExWFn = OS_HOOKS.priv_copy_file_ex_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(existing, new, progress, data, cancel, flags);
    };
    let ok = real(existing, new, progress, data, cancel, flags);
    if ok != 0 {
        record_copy(existing, new);
    }
    ok
}

pub(crate) unsafe extern "system" fn create_directory_w(
    name: *const u16,
    security: *const c_void,
) -> BOOL {
    let real: CreateDirectoryWFn = OS_HOOKS.create_directory_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name, security);
    };
    let ok = real(name, security);
    if let (true, Some(path), Some((ctx, _error))) = (ok != 0, from_wide_ptr(name), after_call()) {
        ctx.registry.note_directory(&path);
        ctx.stream(&ctx.registry.note_write(&path));
    }
    ok
}

pub(crate) unsafe extern "system" fn remove_directory_w(name: *const u16) -> BOOL {
    let real: RemoveDirectoryWFn = OS_HOOKS.remove_directory_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name);
    };
    let ok = real(name);
    if let (true, Some(path), Some((ctx, _error))) = (ok != 0, from_wide_ptr(name), after_call()) {
        ctx.registry.note_directory(&path);
        ctx.stream(&ctx.registry.note_delete(&path));
    }
    ok
}
