//! Detour functions.
//!
//! Shape of every detour:
//!
//! ```ignore
//! let real: FooFn = OS_HOOKS.foo.real();
//! let Some(_guard) = HookGuard::enter() else {
//!     return real(args);
//! };
//! let result = real(args);
//! if let Some((ctx, _error)) = after_call() {
//!     // bookkeeping
//! }
//! result
//! ```
//!
//! The guard is held across the real call, so APIs implemented on top of
//! other hooked APIs (`CopyFileExW` opening both files) are recorded once.

pub(crate) mod env;
pub(crate) mod files;
pub(crate) mod process;

use windows_sys::Win32::Foundation::{HANDLE, INVALID_HANDLE_VALUE};

use crate::context::{context, HooksContext};
use crate::guard::LastErrorGuard;

/// Context for bookkeeping after a real call. The guard restores the
/// caller's last error when dropped.
fn after_call() -> Option<(&'static HooksContext, LastErrorGuard)> {
    let error = LastErrorGuard::save();
    context().map(|ctx| (ctx, error))
}

fn valid_handle(handle: HANDLE) -> Option<usize> {
    (handle != 0 && handle != INVALID_HANDLE_VALUE).then_some(handle as usize)
}
