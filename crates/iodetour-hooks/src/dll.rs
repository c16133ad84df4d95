//! DLL entry: attach and detach of the whole hook layer.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::path::PathBuf;

use iodetour_config::logging::{init_file_logging, LogLevel};
use iodetour_config::{log_hooks_debug, log_hooks_error, log_hooks_info, ENV_HOOKS_LOG};
use iodetour_ipc::windows::{read_current_payload, PipeConnector};
use iodetour_ipc::{EXIT_CHANNEL_OPEN_FAILED, EXIT_CHANNEL_WRITE_FAILED};
use windows_sys::Win32::Foundation::{BOOL, HINSTANCE, HMODULE, TRUE};
use windows_sys::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, GetModuleFileNameW};
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetCurrentProcessId, TerminateProcess};

use crate::context::{self, read_wide, HooksContext};
use crate::error::HookError;
use crate::guard::HookGuard;
use crate::table;

#[no_mangle]
pub extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            // SAFETY: `module` is this DLL, as passed by the loader.
            unsafe {
                DisableThreadLibraryCalls(module);
            }
            process_attach(module);
        }
        DLL_PROCESS_DETACH => process_detach(),
        _ => {}
    }
    TRUE
}

fn terminate(code: u32) -> ! {
    // SAFETY: ends this process; nothing runs afterwards.
    unsafe {
        TerminateProcess(GetCurrentProcess(), code);
    }
    std::process::abort()
}

/// Log to the file named by `IOWRAPPER_HOOKS_LOG`, if any. The host's
/// stderr may be a pipe the build tool parses, so the DLL never writes there.
fn init_logging() {
    let Some(path) = std::env::var_os(ENV_HOOKS_LOG) else {
        return;
    };
    if let Ok(file) = OpenOptions::new().create(true).append(true).open(path) {
        init_file_logging(file, LogLevel::Info);
    }
}

fn process_attach(module: HMODULE) {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    init_logging();

    match attach(module) {
        Ok(()) => {}
        Err(HookError::Payload(e)) => {
            log_hooks_info!(error = %e, "no payload, process runs untracked");
        }
        Err(HookError::Channel(e)) => {
            log_hooks_error!(error = %e, "cannot reach the launcher");
            terminate(EXIT_CHANNEL_OPEN_FAILED);
        }
        Err(e) => {
            log_hooks_error!(error = %e, "hooks not installed");
        }
    }
}

fn attach(module: HMODULE) -> Result<(), HookError> {
    let payload = read_current_payload()?;
    // SAFETY: the buffer is valid for `len` elements.
    let dll_path = read_wide(|buf, len| unsafe { GetModuleFileNameW(module, buf, len) })
        .map(PathBuf::from)
        .ok_or(HookError::ModulePath)?;
    // SAFETY: no preconditions.
    let pid = unsafe { GetCurrentProcessId() };

    let ctx = HooksContext::new(payload, pid, dll_path);
    ctx.channel.open(&PipeConnector)?;
    let ancestry = ctx.channel.payload().ancestry_label();
    context::publish(ctx);

    let bound = table::initialize_real_functions();
    let report = table::attach_detours();
    log_hooks_info!(
        pid,
        ancestry = %ancestry,
        bound,
        attached = report.attached,
        "process tracked"
    );
    Ok(())
}

fn process_detach() {
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    table::detach_detours();

    let Some(ctx) = context::retire() else {
        return;
    };
    match ctx.dump() {
        Ok(sent) => {
            log_hooks_debug!(
                records = sent,
                files = ctx.registry.file_count(),
                children = ctx.registry.proc_count(),
                "registry sent"
            );
            ctx.channel.close();
        }
        Err(e) => {
            log_hooks_error!(error = %e, "cannot send the registry");
            terminate(EXIT_CHANNEL_WRITE_FAILED);
        }
    }
}
