//! Dependency dump filtering.

use iodetour_ipc::{access_to_char, Access, Options};

use crate::info::{FileFlags, FileInfo};

/// One surviving dump entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpLine {
    pub access: Access,
    pub path: String,
}

impl DumpLine {
    pub fn access_char(&self) -> u8 {
        access_to_char(self.access)
    }

    /// `<accessChar><realPath>\n`
    pub fn write_to<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&[self.access_char()])?;
        out.write_all(self.path.as_bytes())?;
        out.write_all(b"\n")
    }
}

const FILTERS: &[(Options, FileFlags)] = &[
    (Options::IGNORE_ABSORBED, FileFlags::ABSORBED),
    (Options::IGNORE_CLEANUP, FileFlags::CLEANUP),
    (Options::IGNORE_DELETE, FileFlags::DELETE),
    (Options::IGNORE_DIRECTORY, FileFlags::DIRECTORY),
    (Options::IGNORE_PIPE, FileFlags::PIPE),
    (Options::IGNORE_STDIO, FileFlags::STDIO),
    (Options::IGNORE_SYSTEM, FileFlags::SYSTEM_PATH),
    (Options::IGNORE_VOLUME, FileFlags::VOLUME),
];

/// Whether an entry with `flags` survives `options`.
pub fn is_reported(flags: FileFlags, options: Options) -> bool {
    for (option, flag) in FILTERS {
        if options.contains(*option) && flags.intersects(*flag) {
            return false;
        }
    }
    if options.contains(Options::IGNORE_TEMPORARY)
        && flags.intersects(FileFlags::TEMPORARY_PATH | FileFlags::TEMPORARY_FILE)
    {
        return false;
    }
    if options.contains(Options::IGNORE_DO_NONE)
        && !flags.intersects(FileFlags::READ | FileFlags::WRITE | FileFlags::EXECUTE)
    {
        return false;
    }
    true
}

pub(crate) fn line_for(info: &FileInfo, options: Options) -> Option<DumpLine> {
    is_reported(info.flags(), options).then(|| DumpLine {
        access: info.access(),
        path: info.real_path().to_string(),
    })
}

/// The entry to stream for `info` right now: it survives `options` and its
/// access changed since it was last streamed.
pub fn stream_line(info: &FileInfo, options: Options) -> Option<DumpLine> {
    if !is_reported(info.flags(), options) {
        return None;
    }
    let access = info.access();
    info.mark_streamed(access).then(|| DumpLine {
        access,
        path: info.real_path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_options_reports_everything() {
        assert!(is_reported(FileFlags::all(), Options::empty()));
        assert!(is_reported(FileFlags::empty(), Options::empty()));
    }

    #[test]
    fn test_each_filter_hits_only_its_flag() {
        for (option, flag) in FILTERS {
            assert!(!is_reported(*flag | FileFlags::READ, *option));
            assert!(is_reported(FileFlags::READ, *option));
        }
    }

    #[test]
    fn test_temporary_covers_path_and_file() {
        let opts = Options::IGNORE_TEMPORARY;
        assert!(!is_reported(FileFlags::TEMPORARY_PATH, opts));
        assert!(!is_reported(FileFlags::TEMPORARY_FILE, opts));
        assert!(is_reported(FileFlags::WRITE, opts));
    }

    #[test]
    fn test_do_none_drops_untouched_entries() {
        let opts = Options::IGNORE_DO_NONE;
        assert!(!is_reported(FileFlags::CANT_READ, opts));
        assert!(!is_reported(FileFlags::DELETE, opts));
        assert!(is_reported(FileFlags::EXECUTE, opts));
    }

    #[test]
    fn test_line_format() {
        let line = DumpLine {
            access: Access::new(true, false, true),
            path: r"C:\bin\tool.exe".into(),
        };
        let mut out = Vec::new();
        line.write_to(&mut out).unwrap();
        assert_eq!(out, b"5C:\\bin\\tool.exe\n");
    }

    #[test]
    fn test_stream_line_follows_access_changes() {
        let reg = crate::FileRegistry::default();
        let info = reg.note_read(r"C:\src\a.c");
        let line = stream_line(&info, Options::empty()).unwrap();
        assert_eq!(line.access, Access::READ);
        assert!(stream_line(&info, Options::empty()).is_none());

        info.set(FileFlags::WRITE);
        let line = stream_line(&info, Options::empty()).unwrap();
        assert_eq!(line.access_char(), b'3');
    }

    #[test]
    fn test_stream_line_honors_filters() {
        let reg = crate::FileRegistry::default();
        let info = reg.note_delete(r"C:\stale.o");
        assert!(stream_line(&info, Options::IGNORE_DELETE).is_none());
    }
}
