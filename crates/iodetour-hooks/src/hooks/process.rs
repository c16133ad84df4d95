//! Process creation and library loading.
//!
//! New processes are always created suspended so the hooks DLL can be
//! queued and the child's payload copied before any of its code runs. The
//! caller's own `CREATE_SUSPENDED` request is honored by not resuming.

use std::ffi::c_void;

use iodetour_config::{log_hooks_debug, log_hooks_warn};
use iodetour_files::command_executable;
use iodetour_ipc::windows::{from_ansi_ptr, from_wide_ptr, inject_library, SharedMemoryCopier};
use iodetour_ipc::{ChildTarget, InheritedStd, StdioInheritance};
use windows_sys::Win32::Foundation::{GetHandleInformation, BOOL, HANDLE, HMODULE};
use windows_sys::Win32::System::Console::GetStdHandle;
use windows_sys::Win32::System::LibraryLoader::GetModuleFileNameW;
use windows_sys::Win32::System::Threading::{
    QueryFullProcessImageNameW, ResumeThread, PROCESS_INFORMATION, STARTUPINFOA, STARTUPINFOW,
};

use super::valid_handle;
use crate::context::{context, read_wide, HooksContext};
use crate::guard::{HookGuard, LastErrorGuard};
use crate::table::OS_HOOKS;

type CreateProcessWFn = unsafe extern "system" fn(
    *const u16,
    *mut u16,
    *const c_void,
    *const c_void,
    BOOL,
    u32,
    *const c_void,
    *const u16,
    *const STARTUPINFOW,
    *mut PROCESS_INFORMATION,
) -> BOOL;
type CreateProcessAFn = unsafe extern "system" fn(
    *const u8,
    *mut u8,
    *const c_void,
    *const c_void,
    BOOL,
    u32,
    *const c_void,
    *const u8,
    *const STARTUPINFOA,
    *mut PROCESS_INFORMATION,
) -> BOOL;
type LoadLibraryExWFn = unsafe extern "system" fn(*const u16, HANDLE, u32) -> HMODULE;

const CREATE_SUSPENDED: u32 = 0x0000_0004;
const STARTF_USESTDHANDLES: u32 = 0x0000_0100;
const HANDLE_FLAG_INHERIT: u32 = 0x0000_0001;
const STD_INPUT_HANDLE: u32 = -10i32 as u32;
const STD_OUTPUT_HANDLE: u32 = -11i32 as u32;
const STD_ERROR_HANDLE: u32 = -12i32 as u32;

const LOAD_LIBRARY_AS_DATAFILE: u32 = 0x0000_0002;
const LOAD_LIBRARY_AS_IMAGE_RESOURCE: u32 = 0x0000_0020;
const LOAD_LIBRARY_AS_DATAFILE_EXCLUSIVE: u32 = 0x0000_0040;

/// Standard handles named in a `STARTUPINFO`, if it supplies any.
struct StartupStdio {
    explicit: bool,
    handles: [HANDLE; 3],
}

impl StartupStdio {
    fn from_w(si: *const STARTUPINFOW) -> Self {
        // SAFETY: a non-null STARTUPINFO is valid for the duration of the call.
        match unsafe { si.as_ref() } {
            Some(si) => Self {
                explicit: si.dwFlags & STARTF_USESTDHANDLES != 0,
                handles: [si.hStdInput, si.hStdOutput, si.hStdError],
            },
            None => Self::inherited(),
        }
    }

    fn from_a(si: *const STARTUPINFOA) -> Self {
        // SAFETY: as in `from_w`.
        match unsafe { si.as_ref() } {
            Some(si) => Self {
                explicit: si.dwFlags & STARTF_USESTDHANDLES != 0,
                handles: [si.hStdInput, si.hStdOutput, si.hStdError],
            },
            None => Self::inherited(),
        }
    }

    fn inherited() -> Self {
        Self {
            explicit: false,
            handles: [0; 3],
        }
    }

    /// The handles the child actually receives.
    fn effective(&self) -> [HANDLE; 3] {
        if self.explicit {
            return self.handles;
        }
        // SAFETY: queries this process's standard handles.
        unsafe {
            [
                GetStdHandle(STD_INPUT_HANDLE),
                GetStdHandle(STD_OUTPUT_HANDLE),
                GetStdHandle(STD_ERROR_HANDLE),
            ]
        }
    }
}

fn is_inheritable(handle: HANDLE) -> bool {
    let mut flags = 0u32;
    // SAFETY: `flags` is a valid out-pointer.
    unsafe { GetHandleInformation(handle, &mut flags) != 0 && flags & HANDLE_FLAG_INHERIT != 0 }
}

/// Tracked paths of the standard handles a child inherits.
fn inherited_stdio(ctx: &HooksContext, inherit: bool, stdio: &StartupStdio) -> StdioInheritance {
    if !inherit {
        return StdioInheritance::default();
    }
    let [stdin, stdout, stderr] = stdio.effective().map(|handle| {
        let handle = valid_handle(handle).filter(|_| is_inheritable(handle))?;
        let info = ctx.registry.recall(handle)?;
        Some(InheritedStd {
            path: info.real_path().to_string(),
            append: info.has(iodetour_files::FileFlags::APPEND),
        })
    });
    StdioInheritance {
        stdin,
        stdout,
        stderr,
    }
}

fn process_image(process: HANDLE) -> Option<String> {
    let mut buf = vec![0u16; 1024];
    let mut len = buf.len() as u32;
    // SAFETY: `len` holds the capacity of `buf` in elements.
    let ok = unsafe { QueryFullProcessImageNameW(process, 0, buf.as_mut_ptr(), &mut len) };
    (ok != 0).then(|| String::from_utf16_lossy(&buf[..len as usize]))
}

/// Queue the hooks DLL in a freshly created child, hand it its payload and
/// record it.
fn track_child(ctx: &HooksContext, pi: &PROCESS_INFORMATION, stdio: StdioInheritance) {
    if let Err(e) = inject_library(pi.hProcess, pi.hThread, &ctx.dll_path) {
        log_hooks_warn!(pid = pi.dwProcessId, error = %e, "cannot inject hooks, child runs untracked");
        return;
    }
    let target = ChildTarget {
        process_handle: pi.hProcess as usize,
        process_id: pi.dwProcessId,
    };
    match ctx.channel.child_payload(&SharedMemoryCopier, &target, &stdio) {
        Ok(label) => {
            log_hooks_debug!(pid = pi.dwProcessId, ancestry = %label, "child process tracked");
            ctx.registry
                .remember_process(pi.hProcess as usize, pi.dwProcessId, label);
        }
        Err(e) => {
            log_hooks_warn!(pid = pi.dwProcessId, error = %e, "cannot copy payload, child runs untracked");
        }
    }
}

/// Bookkeeping shared by both `CreateProcess` flavors, run after the real
/// call succeeded with the child suspended.
fn after_create(
    ctx: &HooksContext,
    pi: &PROCESS_INFORMATION,
    inherit: bool,
    stdio: &StartupStdio,
    tracked: bool,
    caller_suspended: bool,
) {
    let _error = LastErrorGuard::save();
    if let Some(image) = process_image(pi.hProcess) {
        ctx.stream(&ctx.registry.note_execute(&image));
    }
    if tracked {
        track_child(ctx, pi, inherited_stdio(ctx, inherit, stdio));
    }
    if !caller_suspended {
        // SAFETY: the thread handle was just returned by CreateProcess.
        unsafe {
            ResumeThread(pi.hThread);
        }
    }
}

fn is_ignored(ctx: &HooksContext, executable: Option<&str>) -> bool {
    let ignored = executable.is_some_and(|exe| ctx.channel.payload().is_ignored_application(exe));
    if ignored {
        log_hooks_debug!(executable = ?executable, "ignored application runs without hooks");
    }
    ignored
}

pub(crate) unsafe extern "system" fn create_process_w(
    application: *const u16,
    command_line: *mut u16,
    process_attributes: *const c_void,
    thread_attributes: *const c_void,
    inherit: BOOL,
    flags: u32,
    environment: *const c_void,
    current_dir: *const u16,
    startup: *const STARTUPINFOW,
    info: *mut PROCESS_INFORMATION,
) -> BOOL {
    let real: CreateProcessWFn = OS_HOOKS.create_process_w.real();
    let call = |flags| {
        real(
            application,
            command_line,
            process_attributes,
            thread_attributes,
            inherit,
            flags,
            environment,
            current_dir,
            startup,
            info,
        )
    };
    let Some(_guard) = HookGuard::enter() else {
        return call(flags);
    };
    let Some(ctx) = context() else {
        return call(flags);
    };

    let executable = from_wide_ptr(application)
        .or_else(|| from_wide_ptr(command_line).map(|c| command_executable(&c).to_string()));
    let tracked = !is_ignored(ctx, executable.as_deref());
    let ok = call(flags | CREATE_SUSPENDED);
    if let (true, Some(pi)) = (ok != 0, info.as_ref()) {
        let stdio = StartupStdio::from_w(startup);
        after_create(ctx, pi, inherit != 0, &stdio, tracked, flags & CREATE_SUSPENDED != 0);
    }
    ok
}

pub(crate) unsafe extern "system" fn create_process_a(
    application: *const u8,
    command_line: *mut u8,
    process_attributes: *const c_void,
    thread_attributes: *const c_void,
    inherit: BOOL,
    flags: u32,
    environment: *const c_void,
    current_dir: *const u8,
    startup: *const STARTUPINFOA,
    info: *mut PROCESS_INFORMATION,
) -> BOOL {
    let real: CreateProcessAFn = OS_HOOKS.create_process_a.real();
    let call = |flags| {
        real(
            application,
            command_line,
            process_attributes,
            thread_attributes,
            inherit,
            flags,
            environment,
            current_dir,
            startup,
            info,
        )
    };
    let Some(_guard) = HookGuard::enter() else {
        return call(flags);
    };
    let Some(ctx) = context() else {
        return call(flags);
    };

    let executable = from_ansi_ptr(application)
        .or_else(|| from_ansi_ptr(command_line).map(|c| command_executable(&c).to_string()));
    let tracked = !is_ignored(ctx, executable.as_deref());
    let ok = call(flags | CREATE_SUSPENDED);
    if let (true, Some(pi)) = (ok != 0, info.as_ref()) {
        let stdio = StartupStdio::from_a(startup);
        after_create(ctx, pi, inherit != 0, &stdio, tracked, flags & CREATE_SUSPENDED != 0);
    }
    ok
}

pub(crate) unsafe extern "system" fn load_library_ex_w(
    name: *const u16,
    file: HANDLE,
    flags: u32,
) -> HMODULE {
    let real: LoadLibraryExWFn = OS_HOOKS.load_library_ex_w.real();
    let Some(_guard) = HookGuard::enter() else {
        return real(name, file, flags);
    };
    let module = real(name, file, flags);
    if module == 0 {
        return module;
    }
    let Some(ctx) = context() else {
        return module;
    };

    let _error = LastErrorGuard::save();
    let as_data =
        LOAD_LIBRARY_AS_DATAFILE | LOAD_LIBRARY_AS_DATAFILE_EXCLUSIVE | LOAD_LIBRARY_AS_IMAGE_RESOURCE;
    if flags & as_data != 0 {
        if let Some(path) = from_wide_ptr(name) {
            ctx.stream(&ctx.registry.note_read(&path));
        }
    } else if let Some(path) = read_wide(|buf, len| GetModuleFileNameW(module, buf, len)) {
        ctx.stream(&ctx.registry.note_execute(&path));
    }
    module
}
