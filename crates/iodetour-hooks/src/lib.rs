//! # iodetour-hooks
//!
//! DLL loaded into every tracked process. At `DLL_PROCESS_ATTACH` it reads
//! the payload its parent left behind, connects to the launcher's pipe and
//! detours the file, process and environment APIs a build touches. At
//! `DLL_PROCESS_DETACH` it sends the process's file registry to the
//! launcher.
//!
//! # Hook safety
//!
//! - Every detour calls the real function first and returns its result
//!   unchanged; bookkeeping runs afterwards with the thread's last error
//!   preserved.
//! - A thread already inside a detour passes straight through
//!   ([`guard::HookGuard`]), so the DLL never records its own I/O.
//! - Registry memory comes from a private heap, never the host's allocator.
//! - The crate is built with `panic = "abort"`; hook bodies never unwrap.
//!
//! Everything except [`error`] is Windows-only.

#![allow(clippy::missing_safety_doc)]

pub mod error;

#[cfg(windows)]
pub mod context;
#[cfg(windows)]
mod dll;
#[cfg(windows)]
pub mod guard;
#[cfg(windows)]
pub mod heap;
#[cfg(windows)]
mod hooks;
#[cfg(windows)]
pub mod table;

#[cfg(windows)]
#[global_allocator]
static ALLOCATOR: heap::PrivateHeap = heap::PrivateHeap;

pub use error::HookError;
