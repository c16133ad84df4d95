//! Per-thread hook state.

use std::cell::Cell;

use windows_sys::Win32::Foundation::{GetLastError, SetLastError};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running hook code.
///
/// `enter` returns `None` when the thread already holds a guard (a detour
/// reached from our own bookkeeping) or its thread-local storage is gone;
/// the caller then passes straight through to the real function.
pub struct HookGuard(());

impl HookGuard {
    pub fn enter() -> Option<HookGuard> {
        IN_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(HookGuard(()))
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

/// Restores the thread's last-error value on drop, so bookkeeping after a
/// real call cannot change what the caller sees from `GetLastError`.
pub struct LastErrorGuard(u32);

impl LastErrorGuard {
    pub fn save() -> Self {
        // SAFETY: reads the calling thread's last-error slot.
        Self(unsafe { GetLastError() })
    }

    pub fn code(&self) -> u32 {
        self.0
    }
}

impl Drop for LastErrorGuard {
    fn drop(&mut self) {
        // SAFETY: writes the calling thread's last-error slot.
        unsafe { SetLastError(self.0) }
    }
}
