//! Interpreting `CreateFile` requests.
//!
//! Access masks and dispositions are the Win32 values, kept here as plain
//! integers so the interpretation is host-independent.

use std::sync::Arc;

use crate::info::{FileFlags, FileInfo};
use crate::registry::FileRegistry;

pub const GENERIC_READ: u32 = 0x8000_0000;
pub const GENERIC_WRITE: u32 = 0x4000_0000;
pub const GENERIC_ALL: u32 = 0x1000_0000;
pub const FILE_READ_DATA: u32 = 0x0001;
pub const FILE_WRITE_DATA: u32 = 0x0002;
pub const FILE_APPEND_DATA: u32 = 0x0004;

pub const CREATE_NEW: u32 = 1;
pub const CREATE_ALWAYS: u32 = 2;
pub const OPEN_EXISTING: u32 = 3;
pub const OPEN_ALWAYS: u32 = 4;
pub const TRUNCATE_EXISTING: u32 = 5;

pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;

/// The arguments of one `CreateFile` call that matter for tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenRequest {
    pub desired_access: u32,
    pub disposition: u32,
    pub flags: u32,
}

impl OpenRequest {
    pub fn wants_read(&self) -> bool {
        self.desired_access & (GENERIC_READ | GENERIC_ALL | FILE_READ_DATA) != 0
    }

    pub fn wants_write(&self) -> bool {
        self.desired_access & (GENERIC_WRITE | GENERIC_ALL | FILE_WRITE_DATA | FILE_APPEND_DATA)
            != 0
    }

    /// Opened for appending only: writes cannot touch existing content.
    pub fn append_only(&self) -> bool {
        self.desired_access & FILE_APPEND_DATA != 0
            && self.desired_access & (GENERIC_WRITE | GENERIC_ALL | FILE_WRITE_DATA) == 0
    }

    /// Whether a successful open already replaces the content.
    pub fn replaces_content(&self) -> bool {
        self.wants_write()
            && matches!(self.disposition, CREATE_NEW | CREATE_ALWAYS | TRUNCATE_EXISTING)
    }

    pub fn delete_on_close(&self) -> bool {
        self.flags & FILE_FLAG_DELETE_ON_CLOSE != 0
    }
}

impl FileRegistry {
    /// Record the outcome of a `CreateFile` call: `handle` is `None` when
    /// the open failed.
    pub fn record_open(
        &self,
        path: &str,
        request: &OpenRequest,
        handle: Option<usize>,
    ) -> Arc<FileInfo> {
        let Some(handle) = handle else {
            return self.note_open_failed(path, request.wants_read(), request.wants_write());
        };

        let info = self.find_or_create(path);
        let mut flags = FileFlags::empty();
        if request.replaces_content() {
            flags |= FileFlags::WRITE;
        }
        if request.append_only() {
            flags |= FileFlags::APPEND;
        }
        if request.delete_on_close() {
            flags |= FileFlags::TEMPORARY_FILE;
        }
        info.set(flags);
        self.remember_file(handle, Arc::clone(&info));
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FileRegistry {
        FileRegistry::default().with_current_dir(|| Some(r"C:\w".to_string()))
    }

    fn request(desired_access: u32, disposition: u32) -> OpenRequest {
        OpenRequest {
            desired_access,
            disposition,
            flags: 0,
        }
    }

    #[test]
    fn test_read_open_binds_without_access() {
        let reg = registry();
        let info = reg.record_open("a.h", &request(GENERIC_READ, OPEN_EXISTING), Some(4));
        assert_eq!(info.flags(), FileFlags::empty());
        reg.set_read(4, 100);
        assert!(info.has(FileFlags::READ));
    }

    #[test]
    fn test_truncating_open_counts_as_write() {
        let reg = registry();
        let info = reg.record_open("a.obj", &request(GENERIC_WRITE, CREATE_ALWAYS), Some(8));
        assert!(info.has(FileFlags::WRITE));
        let info = reg.record_open("b.obj", &request(GENERIC_WRITE, OPEN_ALWAYS), Some(12));
        assert!(!info.has(FileFlags::WRITE));
    }

    #[test]
    fn test_append_and_delete_on_close() {
        let reg = registry();
        let log = reg.record_open("build.log", &request(FILE_APPEND_DATA, OPEN_ALWAYS), Some(16));
        assert!(log.has(FileFlags::APPEND));

        let scratch = OpenRequest {
            desired_access: GENERIC_READ | GENERIC_WRITE,
            disposition: CREATE_NEW,
            flags: FILE_FLAG_DELETE_ON_CLOSE,
        };
        let info = reg.record_open("scratch", &scratch, Some(20));
        assert!(info.has(FileFlags::TEMPORARY_FILE | FileFlags::WRITE));
    }

    #[test]
    fn test_failed_open_records_denied_access() {
        let reg = registry();
        let info = reg.record_open(
            "missing.h",
            &request(GENERIC_READ, OPEN_EXISTING),
            None,
        );
        assert!(info.has(FileFlags::CANT_READ));
        assert!(!info.has(FileFlags::CANT_WRITE));
        assert!(reg.recall(0).is_none());
    }
}
