//! Process-wide hook state.
//!
//! Built once at `DLL_PROCESS_ATTACH`, published through an atomic pointer
//! and reached by every detour through [`context`]. Detours that run before
//! it is published, or after it is retired, only call the real function.

use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use iodetour_config::{log_hooks_debug, log_hooks_warn};
use iodetour_files::{
    stream_line, Classifier, ClassifierRoots, FileInfo, FileRegistry, RegistryConfig,
};
use iodetour_ipc::windows::PipeTransport;
use iodetour_ipc::{ChannelError, ChannelState, Payload, TraceChannel};
use windows_sys::Win32::Storage::FileSystem::GetTempPathW;
use windows_sys::Win32::System::Environment::GetCurrentDirectoryW;
use windows_sys::Win32::System::SystemInformation::{GetSystemDirectoryW, GetWindowsDirectoryW};

pub struct HooksContext {
    pub registry: FileRegistry,
    pub channel: TraceChannel<PipeTransport>,
    /// Full path of this DLL, injected into every child.
    pub dll_path: PathBuf,
}

static CONTEXT: AtomicPtr<HooksContext> = AtomicPtr::new(ptr::null_mut());

/// The live context, if this process is being tracked.
pub fn context() -> Option<&'static HooksContext> {
    let ctx = CONTEXT.load(Ordering::Acquire);
    // SAFETY: a published context is never freed (see `retire`).
    unsafe { ctx.as_ref() }
}

pub(crate) fn publish(ctx: HooksContext) -> &'static HooksContext {
    let ctx = Box::leak(Box::new(ctx));
    CONTEXT.store(ctx, Ordering::Release);
    ctx
}

/// Unpublish the context. It stays allocated: a detour on another thread
/// may still hold a reference while the process shuts down.
pub(crate) fn retire() -> Option<&'static HooksContext> {
    let ctx = CONTEXT.swap(ptr::null_mut(), Ordering::AcqRel);
    // SAFETY: as in `context`.
    unsafe { ctx.as_ref() }
}

impl HooksContext {
    pub fn new(payload: Payload, own_pid: u32, dll_path: PathBuf) -> Self {
        let classifier = Classifier::new(&classifier_roots(&payload));
        let registry = FileRegistry::new(RegistryConfig {
            mounts: payload.mounted_paths.clone(),
            classifier,
        })
        .with_current_dir(current_directory);
        Self {
            registry,
            channel: TraceChannel::new(payload, own_pid),
            dll_path,
        }
    }

    /// Stream `info` if its reported access changed since it was last
    /// streamed.
    pub fn stream(&self, info: &FileInfo) {
        if self.channel.state() != ChannelState::Connected {
            return;
        }
        let Some(line) = stream_line(info, self.channel.options()) else {
            return;
        };
        if let Err(e) = self.channel.send_observed(line.access, &line.path) {
            log_hooks_warn!(path = %line.path, error = %e, "cannot stream access");
        }
    }

    /// Send the final list of reported file records to the launcher.
    /// Returns the number of records sent.
    pub fn dump(&self) -> Result<usize, ChannelError> {
        let options = self.channel.options();
        self.channel.begin_final_records()?;
        let sent = self
            .registry
            .dump(options, |access, path| self.channel.send_access(access, path))?;

        for (name, reads) in self.registry.environment_reads() {
            log_hooks_debug!(variable = %name, reads, "environment variable read");
        }
        Ok(sent)
    }
}

fn classifier_roots(payload: &Payload) -> ClassifierRoots {
    let mut roots = ClassifierRoots::default();
    // SAFETY (all three queries): the buffer is valid for `len` elements.
    roots
        .system
        .extend(read_wide(|buf, len| unsafe { GetWindowsDirectoryW(buf, len) }));
    roots
        .system
        .extend(read_wide(|buf, len| unsafe { GetSystemDirectoryW(buf, len) }));
    roots
        .temp
        .extend(read_wide(|buf, len| unsafe { GetTempPathW(len, buf) }));
    roots.stdio = [&payload.stdin_path, &payload.stdout_path, &payload.stderr_path]
        .into_iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect();
    roots
}

fn current_directory() -> Option<String> {
    // SAFETY: the buffer is valid for `len` elements.
    read_wide(|buf, len| unsafe { GetCurrentDirectoryW(len, buf) })
}

/// Call a `(buffer, capacity) -> length` Win32 getter, growing the buffer
/// once if the first one was too small.
pub(crate) fn read_wide<F>(mut query: F) -> Option<String>
where
    F: FnMut(*mut u16, u32) -> u32,
{
    let mut buf = vec![0u16; 260];
    for _ in 0..2 {
        let len = query(buf.as_mut_ptr(), buf.len() as u32) as usize;
        if len == 0 {
            log_hooks_warn!("path query failed");
            return None;
        }
        if len < buf.len() {
            return Some(String::from_utf16_lossy(&buf[..len]));
        }
        buf.resize(len + 1, 0);
    }
    None
}
