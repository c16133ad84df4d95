//! Hook table: what gets detoured and where the genuine functions live.
//!
//! Binding happens in two phases. [`initialize_real_functions`] resolves
//! the OS exports and the image entry point at attach time. The CRT's
//! environment functions are only resolved once the entry point runs,
//! when the CRT the program actually uses is loaded
//! ([`attach_crt_hooks`]).
//!
//! Every [`HookEntry`] keeps two addresses: the genuine export (`target`)
//! and what detours must call to reach it (`real`). While a detour is
//! installed `real` is its trampoline; otherwise both are equal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use iodetour_config::{log_hooks_debug, log_hooks_info, log_hooks_warn};
use retour::RawDetour;
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

use crate::error::HookError;
use crate::hooks::{env, files, process};

// ============================================================================
// Entries
// ============================================================================

/// Installed detour. The trampoline stays allocated after removal, since a
/// thread may still be returning through it.
struct Installed(RawDetour);

// SAFETY: `RawDetour` only holds code addresses; enabling and disabling
// are serialized by the entry's mutex.
unsafe impl Send for Installed {}

pub struct HookEntry {
    /// NUL-terminated export name.
    symbol: &'static [u8],
    detour: *const (),
    optional: bool,
    target: AtomicUsize,
    real: AtomicUsize,
    installed: Mutex<Option<Installed>>,
}

// SAFETY: `detour` is a constant code address; the rest is atomics and a
// mutex.
unsafe impl Sync for HookEntry {}

impl HookEntry {
    const fn new(symbol: &'static [u8], detour: *const ()) -> Self {
        Self::with(symbol, detour, false)
    }

    /// An entry whose export may be missing on some Windows versions.
    const fn optional(symbol: &'static [u8], detour: *const ()) -> Self {
        Self::with(symbol, detour, true)
    }

    const fn with(symbol: &'static [u8], detour: *const (), optional: bool) -> Self {
        Self {
            symbol,
            detour,
            optional,
            target: AtomicUsize::new(0),
            real: AtomicUsize::new(0),
            installed: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        let bytes = self.symbol.strip_suffix(b"\0").unwrap_or(self.symbol);
        std::str::from_utf8(bytes).unwrap_or("?")
    }

    pub fn is_bound(&self) -> bool {
        self.target.load(Ordering::Acquire) != 0
    }

    pub fn is_attached(&self) -> bool {
        self.slot().as_ref().is_some_and(|d| d.0.is_enabled())
    }

    /// Address detours call to reach the genuine function.
    ///
    /// # Safety
    /// `F` must be the `extern "system"` (or `extern "C"`) function pointer
    /// type matching this entry, and the entry must be bound.
    pub unsafe fn real<F: Copy>(&self) -> F {
        let addr = self.real.load(Ordering::Acquire);
        debug_assert!(addr != 0, "{} called before binding", self.name());
        std::mem::transmute_copy(&addr)
    }

    /// Resolve the entry from `module`'s export table.
    fn bind(&self, module: HMODULE) -> bool {
        if module == 0 {
            return false;
        }
        // SAFETY: `symbol` is NUL-terminated and `module` is a loaded module.
        match unsafe { GetProcAddress(module, self.symbol.as_ptr()) } {
            Some(export) => {
                self.bind_address(export as usize);
                true
            }
            None => false,
        }
    }

    fn bind_address(&self, addr: usize) {
        self.target.store(addr, Ordering::Release);
        self.real.store(addr, Ordering::Release);
    }

    fn slot(&self) -> MutexGuard<'_, Option<Installed>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self) -> Result<bool, HookError> {
        let slot = self.slot();
        let Some(installed) = slot.as_ref() else {
            return Ok(false);
        };
        if !installed.0.is_enabled() {
            return Ok(false);
        }
        // SAFETY: restores the bytes saved when the detour was created.
        unsafe { installed.0.disable() }.map_err(|e| HookError::Detour {
            function: self.name(),
            message: e.to_string(),
        })?;
        self.real
            .store(self.target.load(Ordering::Acquire), Ordering::Release);
        Ok(true)
    }
}

/// Outcome counts of one attach or detach pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookReport {
    pub attached: u32,
    pub detached: u32,
    pub skipped: u32,
    pub failed: u32,
}

// ============================================================================
// Tables
// ============================================================================

pub struct OsHooks {
    pub create_file_w: HookEntry,
    pub create_file_a: HookEntry,
    pub read_file: HookEntry,
    pub write_file: HookEntry,
    pub close_handle: HookEntry,
    pub duplicate_handle: HookEntry,
    pub create_pipe: HookEntry,
    pub delete_file_w: HookEntry,
    pub delete_file_a: HookEntry,
    pub move_file_ex_w: HookEntry,
    pub copy_file_ex_w: HookEntry,
    pub priv_copy_file_ex_w: HookEntry,
    pub create_directory_w: HookEntry,
    pub remove_directory_w: HookEntry,
    pub create_process_w: HookEntry,
    pub create_process_a: HookEntry,
    pub load_library_ex_w: HookEntry,
}

impl OsHooks {
    fn entries(&self) -> [&HookEntry; 17] {
        [
            &self.create_file_w,
            &self.create_file_a,
            &self.read_file,
            &self.write_file,
            &self.close_handle,
            &self.duplicate_handle,
            &self.create_pipe,
            &self.delete_file_w,
            &self.delete_file_a,
            &self.move_file_ex_w,
            &self.copy_file_ex_w,
            &self.priv_copy_file_ex_w,
            &self.create_directory_w,
            &self.remove_directory_w,
            &self.create_process_w,
            &self.create_process_a,
            &self.load_library_ex_w,
        ]
    }
}

pub static OS_HOOKS: OsHooks = OsHooks {
    create_file_w: HookEntry::new(b"CreateFileW\0", files::create_file_w as *const ()),
    create_file_a: HookEntry::new(b"CreateFileA\0", files::create_file_a as *const ()),
    read_file: HookEntry::new(b"ReadFile\0", files::read_file as *const ()),
    write_file: HookEntry::new(b"WriteFile\0", files::write_file as *const ()),
    close_handle: HookEntry::new(b"CloseHandle\0", files::close_handle as *const ()),
    duplicate_handle: HookEntry::new(b"DuplicateHandle\0", files::duplicate_handle as *const ()),
    create_pipe: HookEntry::new(b"CreatePipe\0", files::create_pipe as *const ()),
    delete_file_w: HookEntry::new(b"DeleteFileW\0", files::delete_file_w as *const ()),
    delete_file_a: HookEntry::new(b"DeleteFileA\0", files::delete_file_a as *const ()),
    move_file_ex_w: HookEntry::new(b"MoveFileExW\0", files::move_file_ex_w as *const ()),
    copy_file_ex_w: HookEntry::new(b"CopyFileExW\0", files::copy_file_ex_w as *const ()),
    priv_copy_file_ex_w: HookEntry::optional(
        b"PrivCopyFileExW\0",
        files::priv_copy_file_ex_w as *const (),
    ),
    create_directory_w: HookEntry::new(
        b"CreateDirectoryW\0",
        files::create_directory_w as *const (),
    ),
    remove_directory_w: HookEntry::new(
        b"RemoveDirectoryW\0",
        files::remove_directory_w as *const (),
    ),
    create_process_w: HookEntry::new(b"CreateProcessW\0", process::create_process_w as *const ()),
    create_process_a: HookEntry::new(b"CreateProcessA\0", process::create_process_a as *const ()),
    load_library_ex_w: HookEntry::new(
        b"LoadLibraryExW\0",
        process::load_library_ex_w as *const (),
    ),
};

/// The image entry point; bound from the PE header, not an export.
pub static ENTRY_POINT: HookEntry = HookEntry::new(b"entry point\0", env::entry_point as *const ());

pub struct CrtHooks {
    pub getenv: HookEntry,
    pub wgetenv: HookEntry,
    pub getenv_s: HookEntry,
    pub wgetenv_s: HookEntry,
}

impl CrtHooks {
    fn entries(&self) -> [&HookEntry; 4] {
        [&self.getenv, &self.wgetenv, &self.getenv_s, &self.wgetenv_s]
    }
}

pub static CRT_HOOKS: CrtHooks = CrtHooks {
    getenv: HookEntry::new(b"getenv\0", env::getenv as *const ()),
    wgetenv: HookEntry::new(b"_wgetenv\0", env::wgetenv as *const ()),
    getenv_s: HookEntry::new(b"getenv_s\0", env::getenv_s as *const ()),
    wgetenv_s: HookEntry::new(b"_wgetenv_s\0", env::wgetenv_s as *const ()),
};

/// Basename of the CRT the environment hooks were bound to, resolved once.
static CRT_MODULE: OnceLock<Option<String>> = OnceLock::new();

// ============================================================================
// Transactions
// ============================================================================

/// A batch of detours created together and enabled on commit.
pub struct Transaction {
    pending: Vec<(&'static HookEntry, RawDetour)>,
    report: HookReport,
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            pending: Vec::new(),
            report: HookReport::default(),
        }
    }

    pub fn attach(&mut self, entry: &'static HookEntry) {
        if !entry.is_bound() {
            if entry.optional {
                log_hooks_debug!(function = entry.name(), "optional export missing, not hooked");
            } else {
                log_hooks_warn!(function = entry.name(), "export missing, not hooked");
            }
            self.report.skipped += 1;
            return;
        }
        if entry.is_attached() {
            return;
        }

        let target = entry.target.load(Ordering::Acquire) as *const ();
        // SAFETY: `target` is the start of a loaded function and `detour`
        // has the same signature.
        match unsafe { RawDetour::new(target, entry.detour) } {
            Ok(detour) => self.pending.push((entry, detour)),
            Err(e) => {
                log_hooks_warn!(function = entry.name(), error = %e, "cannot create detour");
                self.report.failed += 1;
            }
        }
    }

    pub fn commit(mut self) -> HookReport {
        for (entry, detour) in self.pending.drain(..) {
            // Route callers through the trampoline before the jump goes in,
            // so a detour running concurrently never calls back into itself.
            let trampoline = detour.trampoline() as *const () as usize;
            entry.real.store(trampoline, Ordering::Release);

            // SAFETY: patches the target's prologue; the trampoline keeps
            // the displaced instructions.
            match unsafe { detour.enable() } {
                Ok(()) => {
                    *entry.slot() = Some(Installed(detour));
                    self.report.attached += 1;
                }
                Err(e) => {
                    entry
                        .real
                        .store(entry.target.load(Ordering::Acquire), Ordering::Release);
                    log_hooks_warn!(function = entry.name(), error = %e, "cannot enable detour");
                    self.report.failed += 1;
                }
            }
        }
        self.report
    }
}

// ============================================================================
// Binding, attach and detach
// ============================================================================

fn module_handle(name: &str) -> HMODULE {
    let wide = iodetour_ipc::windows::to_wide(name);
    // SAFETY: `wide` is NUL-terminated; no reference count is taken.
    unsafe { GetModuleHandleW(wide.as_ptr()) }
}

/// Bind every OS entry and the image entry point. Returns the number of
/// entries bound.
pub fn initialize_real_functions() -> u32 {
    // kernelbase first: programs importing through API sets never pass
    // through kernel32's forwarding stubs.
    let modules = [module_handle("kernelbase.dll"), module_handle("kernel32.dll")];
    let mut bound = 0;
    for entry in OS_HOOKS.entries() {
        if modules.iter().any(|&module| entry.bind(module)) {
            bound += 1;
        }
    }

    // SAFETY: reads the headers of the process image, mapped for its lifetime.
    match unsafe { image_entry_point() } {
        Some(addr) => {
            ENTRY_POINT.bind_address(addr);
            bound += 1;
        }
        None => log_hooks_warn!("process image has no entry point"),
    }
    bound
}

/// Address of the process image's entry point, from its PE headers.
unsafe fn image_entry_point() -> Option<usize> {
    const E_LFANEW: usize = 0x3C;
    // Signature (4) + IMAGE_FILE_HEADER (20) + offset in the optional header (16).
    const ENTRY_RVA: usize = 4 + 20 + 16;

    let base = GetModuleHandleW(std::ptr::null()) as *const u8;
    if base.is_null() || std::slice::from_raw_parts(base, 2) != b"MZ" {
        return None;
    }
    let nt = base.add((base.add(E_LFANEW) as *const u32).read_unaligned() as usize);
    if std::slice::from_raw_parts(nt, 4) != b"PE\0\0" {
        return None;
    }
    let rva = (nt.add(ENTRY_RVA) as *const u32).read_unaligned();
    (rva != 0).then(|| base as usize + rva as usize)
}

/// Attach every bound OS entry and the entry-point hook.
pub fn attach_detours() -> HookReport {
    let mut tx = Transaction::begin();
    for entry in OS_HOOKS.entries() {
        tx.attach(entry);
    }
    tx.attach(&ENTRY_POINT);
    let report = tx.commit();
    log_hooks_info!(
        attached = report.attached,
        skipped = report.skipped,
        failed = report.failed,
        "detours attached"
    );
    report
}

/// Bind and attach the environment hooks against the CRT `find_crt`
/// picks, once per process. Later calls return the first outcome.
pub fn attach_crt_hooks<F>(find_crt: F) -> Option<&'static str>
where
    F: FnOnce() -> Option<(String, HMODULE)>,
{
    CRT_MODULE
        .get_or_init(|| {
            let Some((name, module)) = find_crt() else {
                log_hooks_warn!("no CRT loaded, environment reads are not tracked");
                return None;
            };
            let mut tx = Transaction::begin();
            for entry in CRT_HOOKS.entries() {
                entry.bind(module);
                tx.attach(entry);
            }
            let report = tx.commit();
            log_hooks_debug!(crt = %name, attached = report.attached, "environment hooks attached");
            Some(name)
        })
        .as_deref()
}

/// Remove every installed detour, most recently attached first.
pub fn detach_detours() -> HookReport {
    let mut report = HookReport::default();
    let os = OS_HOOKS.entries();
    let all = CRT_HOOKS
        .entries()
        .into_iter()
        .rev()
        .chain(std::iter::once(&ENTRY_POINT))
        .chain(os.into_iter().rev());
    for entry in all {
        match entry.detach() {
            Ok(true) => report.detached += 1,
            Ok(false) => {}
            Err(e) => {
                log_hooks_warn!(error = %e, "detach failed");
                report.failed += 1;
            }
        }
    }
    log_hooks_debug!(detached = report.detached, failed = report.failed, "detours removed");
    report
}
