//! Per-file and per-process records.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use iodetour_ipc::{access_to_char, Access};

bitflags! {
    /// What has been observed for one file across the whole process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileFlags: u32 {
        const READ           = 1 << 0;
        const WRITE          = 1 << 1;
        const EXECUTE        = 1 << 2;
        const DELETE         = 1 << 3;
        const CLEANUP        = 1 << 4;
        const DIRECTORY      = 1 << 5;
        const PIPE           = 1 << 6;
        const STDIO          = 1 << 7;
        const SYSTEM_PATH    = 1 << 8;
        const TEMPORARY_PATH = 1 << 9;
        const TEMPORARY_FILE = 1 << 10;
        const VOLUME         = 1 << 11;
        const ABSORBED       = 1 << 12;
        const CANT_READ      = 1 << 13;
        const CANT_WRITE     = 1 << 14;
        const APPEND         = 1 << 15;
    }
}

/// One file, shared by every handle that refers to it.
///
/// Flags only ever gain bits, with one exception: [`FileInfo::correct_on_close`]
/// drops `CANT_READ`/`CANT_WRITE` once a handle proved the access possible.
#[derive(Debug)]
pub struct FileInfo {
    input_path: Box<str>,
    real_path: Box<str>,
    flags: AtomicU32,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// Access character last streamed to the launcher, 0 if none.
    streamed: AtomicU8,
    index: u64,
}

impl FileInfo {
    pub(crate) fn new(input_path: String, real_path: String, flags: FileFlags, index: u64) -> Self {
        Self {
            input_path: input_path.into_boxed_str(),
            real_path: real_path.into_boxed_str(),
            flags: AtomicU32::new(flags.bits()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            streamed: AtomicU8::new(0),
            index,
        }
    }

    /// Normalized path as the process named it.
    pub fn input_path(&self) -> &str {
        &self.input_path
    }

    /// Path after mount remapping.
    pub fn real_path(&self) -> &str {
        &self.real_path
    }

    /// Creation order within the registry.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn has(&self, flags: FileFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Add flags. Returns the flags before the update.
    pub fn set(&self, flags: FileFlags) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub fn add_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn access(&self) -> Access {
        let flags = self.flags();
        Access::new(
            flags.contains(FileFlags::READ),
            flags.contains(FileFlags::WRITE),
            flags.contains(FileFlags::EXECUTE),
        )
    }

    /// Note that `access` was streamed. Returns `false` when that access
    /// already was the last one streamed.
    pub fn mark_streamed(&self, access: Access) -> bool {
        let c = access_to_char(access);
        self.streamed.swap(c, Ordering::AcqRel) != c
    }

    /// Drop a stale `CANT_READ`/`CANT_WRITE` when the matching access was
    /// observed after all.
    pub fn correct_on_close(&self) {
        let flags = self.flags();
        let mut clear = FileFlags::empty();
        if flags.contains(FileFlags::READ | FileFlags::CANT_READ) {
            clear |= FileFlags::CANT_READ;
        }
        if flags.contains(FileFlags::WRITE | FileFlags::CANT_WRITE) {
            clear |= FileFlags::CANT_WRITE;
        }
        if !clear.is_empty() {
            self.flags.fetch_and(!clear.bits(), Ordering::AcqRel);
        }
    }
}

/// A child process created by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub process_handle: usize,
    pub process_id: u32,
    pub index: u64,
    /// Dotted ancestry label of the child, e.g. `1.3.7.`.
    pub ancestry_label: String,
}

/// What a tracked handle refers to.
#[derive(Debug, Clone)]
pub enum Binding {
    File(Arc<FileInfo>),
    Process(Arc<ProcInfo>),
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Binding::File(a), Binding::File(b)) => Arc::ptr_eq(a, b),
            (Binding::Process(a), Binding::Process(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(flags: FileFlags) -> FileInfo {
        FileInfo::new(r"C:\a".into(), r"C:\a".into(), flags, 0)
    }

    #[test]
    fn test_set_is_monotone() {
        let f = info(FileFlags::empty());
        assert_eq!(f.set(FileFlags::READ), FileFlags::empty());
        assert_eq!(f.set(FileFlags::WRITE), FileFlags::READ);
        f.set(FileFlags::READ);
        assert!(f.has(FileFlags::READ | FileFlags::WRITE));
        assert_eq!(f.access(), Access::new(true, true, false));
    }

    #[test]
    fn test_correct_on_close_only_clears_proven_access() {
        let f = info(FileFlags::CANT_READ | FileFlags::CANT_WRITE);
        f.correct_on_close();
        assert!(f.has(FileFlags::CANT_READ | FileFlags::CANT_WRITE));

        f.set(FileFlags::READ);
        f.correct_on_close();
        assert!(!f.has(FileFlags::CANT_READ));
        assert!(f.has(FileFlags::CANT_WRITE));
        assert!(f.has(FileFlags::READ));
    }

    #[test]
    fn test_byte_counters() {
        let f = info(FileFlags::empty());
        f.add_read(10);
        f.add_read(5);
        f.add_written(7);
        assert_eq!((f.bytes_read(), f.bytes_written()), (15, 7));
    }

    #[test]
    fn test_mark_streamed_only_on_change() {
        let f = info(FileFlags::empty());
        assert!(f.mark_streamed(Access::READ));
        assert!(!f.mark_streamed(Access::READ));
        assert!(f.mark_streamed(Access::new(true, true, false)));
    }
}
