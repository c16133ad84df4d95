//! Console control forwarding.
//!
//! The root process runs in its own process group, so a Ctrl+C typed at
//! the console does not reach it. The launcher swallows the event and
//! forwards it as `CTRL_BREAK_EVENT` to the child's group, then keeps
//! waiting so the child's exit code is still reported.

use std::sync::atomic::{AtomicU32, Ordering};

use iodetour_config::{log_launcher_debug, log_launcher_warn};
use windows_sys::Win32::Foundation::{BOOL, FALSE, TRUE};
use windows_sys::Win32::System::Console::{
    GenerateConsoleCtrlEvent, SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_C_EVENT,
};

/// Process group id (the root's pid) receiving forwarded events.
static CHILD_GROUP: AtomicU32 = AtomicU32::new(0);

unsafe extern "system" fn forward_ctrl_event(event: u32) -> BOOL {
    match event {
        CTRL_C_EVENT | CTRL_BREAK_EVENT => {
            let group = CHILD_GROUP.load(Ordering::Acquire);
            if group != 0 {
                GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, group);
            }
            TRUE
        }
        _ => FALSE,
    }
}

/// Forward Ctrl+C and Ctrl+Break to the process group of `child_pid`.
pub fn forward_ctrl_events(child_pid: u32) {
    CHILD_GROUP.store(child_pid, Ordering::Release);
    // SAFETY: registers a handler with the signature the console expects.
    if unsafe { SetConsoleCtrlHandler(Some(forward_ctrl_event), TRUE) } == 0 {
        log_launcher_warn!("cannot install the console control handler");
    } else {
        log_launcher_debug!(group = child_pid, "console control events forwarded");
    }
}
