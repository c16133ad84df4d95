//! The process-wide file and handle registry.
//!
//! # Concurrency
//!
//! Every hooked thread reaches the registry at once. Both maps are sharded
//! (`dashmap`); flags and counters are atomics, so concurrent upgrades of the
//! same file need no ordering. Path lookups fold into a per-thread buffer
//! and borrow it as the key; a key is only copied into the map when the path
//! is seen for the first time.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use iodetour_config::log_registry_debug;
use iodetour_ipc::{Access, MountedPath, Options};

use crate::classify::Classifier;
use crate::dump::{line_for, DumpLine};
use crate::info::{Binding, FileFlags, FileInfo, ProcInfo};
use crate::path::{fold_into, is_fully_qualified, normalize, MountTable};

type CurrentDir = Box<dyn Fn() -> Option<String> + Send + Sync>;

thread_local! {
    static FOLD_BUF: Cell<String> = const { Cell::new(String::new()) };
}

/// Run `f` on the case-folded form of `path`. The buffer is taken out of the
/// thread-local for the call, so a nested call simply gets a fresh one.
fn with_folded<R>(path: &str, f: impl FnOnce(&str) -> R) -> R {
    let mut key = FOLD_BUF.try_with(Cell::take).unwrap_or_default();
    fold_into(path, &mut key);
    let result = f(&key);
    let _ = FOLD_BUF.try_with(|buf| buf.set(key));
    result
}

fn process_current_dir() -> Option<String> {
    std::env::current_dir()
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Construction parameters, usually derived from the payload.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub mounts: Vec<MountedPath>,
    pub classifier: Classifier,
}

pub struct FileRegistry {
    files: DashMap<Box<str>, Arc<FileInfo>>,
    handles: DashMap<usize, Binding>,
    environment: DashMap<Box<str>, u64>,
    mounts: MountTable,
    classifier: Classifier,
    next_index: AtomicU64,
    current_dir: CurrentDir,
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("files", &self.files.len())
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl FileRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            files: DashMap::new(),
            handles: DashMap::new(),
            environment: DashMap::new(),
            mounts: MountTable::new(&config.mounts),
            classifier: config.classifier,
            next_index: AtomicU64::new(0),
            current_dir: Box::new(process_current_dir),
        }
    }

    /// Resolve relative paths against `cwd` instead of the process directory.
    pub fn with_current_dir<F>(mut self, cwd: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.current_dir = Box::new(cwd);
        self
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// Display form of `path`: normalized, relative paths resolved.
    fn normalized(&self, path: &str) -> String {
        let cwd = if is_fully_qualified(path) {
            None
        } else {
            (self.current_dir)()
        };
        normalize(path, cwd.as_deref())
    }

    /// Look up `path`, creating and classifying its record on first sight.
    pub fn find_or_create(&self, path: &str) -> Arc<FileInfo> {
        let normalized = self.normalized(path);
        with_folded(&normalized, |key| {
            if let Some(info) = self.files.get(key) {
                return Arc::clone(info.value());
            }
            let entry = self.files.entry(key.into()).or_insert_with(|| {
                let real = self.mounts.remap(&normalized);
                let real = real.unwrap_or_else(|| normalized.clone());
                let flags = self.classifier.classify(&real);
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                Arc::new(FileInfo::new(normalized.clone(), real, flags, index))
            });
            Arc::clone(entry.value())
        })
    }

    /// Existing record for `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<Arc<FileInfo>> {
        with_folded(&self.normalized(path), |key| {
            self.files.get(key).map(|info| Arc::clone(info.value()))
        })
    }

    fn note(&self, path: &str, flags: FileFlags) -> Arc<FileInfo> {
        let info = self.find_or_create(path);
        info.set(flags);
        info
    }

    pub fn note_read(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::READ)
    }

    pub fn note_write(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::WRITE)
    }

    pub fn note_execute(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::EXECUTE)
    }

    /// A file this process deletes. Files it wrote earlier count as cleaned
    /// up rather than deleted.
    pub fn note_delete(&self, path: &str) -> Arc<FileInfo> {
        let info = self.find_or_create(path);
        if info.has(FileFlags::WRITE) {
            info.set(FileFlags::CLEANUP);
        } else {
            info.set(FileFlags::DELETE);
        }
        info
    }

    pub fn note_cleanup(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::CLEANUP)
    }

    pub fn note_directory(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::DIRECTORY)
    }

    /// A file whose content moved into another file.
    pub fn mark_absorbed(&self, path: &str) -> Arc<FileInfo> {
        self.note(path, FileFlags::ABSORBED)
    }

    /// An open that failed for the requested access.
    pub fn note_open_failed(&self, path: &str, read: bool, write: bool) -> Arc<FileInfo> {
        let mut flags = FileFlags::empty();
        if read {
            flags |= FileFlags::CANT_READ;
        }
        if write {
            flags |= FileFlags::CANT_WRITE;
        }
        self.note(path, flags)
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Bind `handle`. Binding the same handle again replaces the binding, so
    /// repeating a call is harmless.
    pub fn remember(&self, handle: usize, binding: Binding) {
        self.handles.insert(handle, binding);
    }

    pub fn remember_file(&self, handle: usize, info: Arc<FileInfo>) {
        self.remember(handle, Binding::File(info));
    }

    /// Record a child process and bind its handle.
    pub fn remember_process(
        &self,
        handle: usize,
        process_id: u32,
        ancestry_label: String,
    ) -> Arc<ProcInfo> {
        let proc = Arc::new(ProcInfo {
            process_handle: handle,
            process_id,
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            ancestry_label,
        });
        self.remember(handle, Binding::Process(Arc::clone(&proc)));
        proc
    }

    pub fn recall(&self, handle: usize) -> Option<Arc<FileInfo>> {
        match self.handles.get(&handle).as_deref() {
            Some(Binding::File(info)) => Some(Arc::clone(info)),
            _ => None,
        }
    }

    pub fn recall_proc(&self, handle: usize) -> Option<Arc<ProcInfo>> {
        match self.handles.get(&handle).as_deref() {
            Some(Binding::Process(proc)) => Some(Arc::clone(proc)),
            _ => None,
        }
    }

    /// Unbind `handle`. The file record itself stays, its flags untouched
    /// until the close is known to have succeeded (see [`FileRegistry::closed`]).
    pub fn forget(&self, handle: usize) -> Option<Binding> {
        self.handles.remove(&handle).map(|(_, binding)| binding)
    }

    /// A handle bound to `binding` was closed successfully.
    pub fn closed(&self, binding: &Binding) {
        if let Binding::File(info) = binding {
            info.correct_on_close();
        }
    }

    /// Give `dst` the binding of `src`. No-op when `src` is unbound.
    pub fn duplicate(&self, dst: usize, src: usize) {
        let binding = self.handles.get(&src).map(|b| b.value().clone());
        if let Some(binding) = binding {
            self.handles.insert(dst, binding);
        }
    }

    pub fn set_read(&self, handle: usize, bytes: u64) {
        if let Some(info) = self.recall(handle) {
            info.set(FileFlags::READ);
            info.add_read(bytes);
        }
    }

    pub fn set_write(&self, handle: usize, bytes: u64) {
        if let Some(info) = self.recall(handle) {
            info.set(FileFlags::WRITE);
            info.add_written(bytes);
        }
    }

    pub fn set_execute(&self, handle: usize) {
        if let Some(info) = self.recall(handle) {
            info.set(FileFlags::EXECUTE);
        }
    }

    // ========================================================================
    // Environment
    // ========================================================================

    pub fn note_environment(&self, name: &str) {
        if let Some(mut count) = self.environment.get_mut(name) {
            *count += 1;
            return;
        }
        *self.environment.entry(name.into()).or_insert(0) += 1;
    }

    /// Variable names read through the CRT, with read counts, sorted by name.
    pub fn environment_reads(&self) -> Vec<(String, u64)> {
        let mut reads: Vec<(String, u64)> = self
            .environment
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        reads.sort();
        reads
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Child processes whose handles are still open.
    pub fn proc_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|b| matches!(b.value(), Binding::Process(_)))
            .count()
    }

    /// All file records in creation order.
    pub fn files(&self) -> Vec<Arc<FileInfo>> {
        let mut files: Vec<Arc<FileInfo>> =
            self.files.iter().map(|e| Arc::clone(e.value())).collect();
        files.sort_by_key(|f| f.index());
        files
    }

    pub fn dump_lines(&self, options: Options) -> Vec<DumpLine> {
        self.files()
            .iter()
            .filter_map(|info| line_for(info, options))
            .collect()
    }

    /// Feed every surviving entry to `sink`, in creation order. Stops at the
    /// first sink error. Returns the number of entries sent.
    pub fn dump<E, F>(&self, options: Options, mut sink: F) -> Result<usize, E>
    where
        F: FnMut(Access, &str) -> Result<(), E>,
    {
        let lines = self.dump_lines(options);
        for line in &lines {
            sink(line.access, &line.path)?;
        }
        log_registry_debug!(
            files = self.file_count(),
            reported = lines.len(),
            "registry dumped"
        );
        Ok(lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FileRegistry {
        FileRegistry::default().with_current_dir(|| Some(r"C:\proj".to_string()))
    }

    #[test]
    fn test_find_or_create_folds_case() {
        let reg = registry();
        let a = reg.find_or_create(r"C:\Proj\Main.c");
        let b = reg.find_or_create("main.c");
        let c = reg.find_or_create("c:/proj/./MAIN.C");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(a.input_path(), r"C:\Proj\Main.c");
        assert_eq!(reg.file_count(), 1);
    }

    #[test]
    fn test_indices_follow_creation_order() {
        let reg = registry();
        let first = reg.find_or_create("b.c");
        let second = reg.find_or_create("a.c");
        reg.find_or_create("b.c");
        assert!(first.index() < second.index());
        let order: Vec<_> = reg.files().iter().map(|f| f.real_path().to_string()).collect();
        assert_eq!(order, vec![r"C:\proj\b.c", r"C:\proj\a.c"]);
    }

    #[test]
    fn test_mount_remaps_real_path() {
        let reg = FileRegistry::new(RegistryConfig {
            mounts: vec![MountedPath::new(r"X:\", r"C:\mnt\x")],
            classifier: Classifier::default(),
        });
        let info = reg.find_or_create(r"x:\inc\a.h");
        assert_eq!(info.input_path(), r"x:\inc\a.h");
        assert_eq!(info.real_path(), r"C:\mnt\x\inc\a.h");
    }

    #[test]
    fn test_remember_twice_is_idempotent() {
        let reg = registry();
        let info = reg.find_or_create("a.c");
        reg.remember_file(7, Arc::clone(&info));
        reg.remember_file(7, Arc::clone(&info));
        assert!(Arc::ptr_eq(&reg.recall(7).unwrap(), &info));
        assert_eq!(reg.file_count(), 1);
        assert!(reg.forget(7).is_some());
        assert!(reg.recall(7).is_none());
        assert!(reg.forget(7).is_none());
    }

    #[test]
    fn test_set_on_unbound_handle_is_noop() {
        let reg = registry();
        reg.set_read(99, 10);
        reg.set_write(99, 10);
        reg.set_execute(99);
        assert_eq!(reg.file_count(), 0);
    }

    #[test]
    fn test_duplicate_shares_record() {
        let reg = registry();
        let info = reg.find_or_create("a.c");
        reg.remember_file(1, info);
        reg.duplicate(2, 1);
        reg.duplicate(4, 3);
        reg.set_write(2, 12);
        let info = reg.recall(1).unwrap();
        assert!(info.has(FileFlags::WRITE));
        assert_eq!(info.bytes_written(), 12);
        assert!(reg.recall(4).is_none());
    }

    #[test]
    fn test_process_bindings() {
        let reg = registry();
        let proc = reg.remember_process(0x40, 1234, "1.2.".into());
        reg.remember_file(0x44, reg.find_or_create("a.c"));
        assert_eq!(reg.proc_count(), 1);
        assert_eq!(reg.recall_proc(0x40).unwrap().process_id, 1234);
        assert!(reg.recall(0x40).is_none());
        assert!(reg.recall_proc(0x44).is_none());
        assert_eq!(reg.forget(0x40), Some(Binding::Process(proc)));
        assert_eq!(reg.proc_count(), 0);
    }

    #[test]
    fn test_delete_after_write_is_cleanup() {
        let reg = registry();
        reg.note_write("obj.tmp");
        reg.note_delete("obj.tmp");
        reg.note_delete("stale.o");
        assert!(reg.lookup("obj.tmp").unwrap().has(FileFlags::CLEANUP));
        assert!(!reg.lookup("obj.tmp").unwrap().has(FileFlags::DELETE));
        assert!(reg.lookup("stale.o").unwrap().has(FileFlags::DELETE));
    }

    #[test]
    fn test_close_corrects_cant_read() {
        let reg = registry();
        reg.note_open_failed("cfg.ini", true, false);
        let info = reg.find_or_create("cfg.ini");
        reg.remember_file(5, Arc::clone(&info));
        reg.set_read(5, 3);
        assert!(info.has(FileFlags::CANT_READ));
        let binding = reg.forget(5).unwrap();
        reg.closed(&binding);
        assert!(!info.has(FileFlags::CANT_READ));
        assert!(info.has(FileFlags::READ));
    }

    #[test]
    fn test_failed_close_keeps_flags() {
        let reg = registry();
        let info = reg.note_open_failed("cfg.ini", true, false);
        reg.remember_file(5, Arc::clone(&info));
        reg.set_read(5, 3);

        // Unbound before the real close, which then fails: rebind untouched.
        let binding = reg.forget(5).unwrap();
        assert!(info.has(FileFlags::CANT_READ));
        reg.remember(5, binding);
        assert!(info.has(FileFlags::CANT_READ));
        assert!(Arc::ptr_eq(&reg.recall(5).unwrap(), &info));
    }

    #[test]
    fn test_lookups_share_the_thread_buffer() {
        let reg = registry();
        let a = reg.find_or_create(r"C:\Proj\Long\Directory\Name\Main.c");
        let held = FOLD_BUF.with(|buf| {
            let key = buf.take();
            let capacity = key.capacity();
            buf.set(key);
            capacity
        });
        assert!(held >= a.input_path().len());

        let nested = with_folded("OUTER", |outer| {
            let inner = with_folded("Inner", str::to_string);
            (outer.to_string(), inner)
        });
        assert_eq!(nested, ("outer".to_string(), "inner".to_string()));
        assert!(Arc::ptr_eq(&reg.lookup(r"c:\proj\long\DIRECTORY\name\main.C").unwrap(), &a));
    }

    #[test]
    fn test_environment_reads() {
        let reg = registry();
        reg.note_environment("PATH");
        reg.note_environment("INCLUDE");
        reg.note_environment("PATH");
        assert_eq!(
            reg.environment_reads(),
            vec![("INCLUDE".to_string(), 1), ("PATH".to_string(), 2)]
        );
    }

    #[test]
    fn test_dump_stops_on_sink_error() {
        let reg = registry();
        reg.note_read("a.c");
        reg.note_read("b.c");
        let mut seen = 0;
        let result: Result<usize, &str> = reg.dump(Options::empty(), |_, _| {
            seen += 1;
            Err("pipe closed")
        });
        assert_eq!(result, Err("pipe closed"));
        assert_eq!(seen, 1);
    }
}
