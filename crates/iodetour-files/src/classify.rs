//! Path classification: system, temporary, pipe, stdio and volume paths.

use crate::info::FileFlags;
use crate::path::{fold, normalize};

const PIPE_PREFIX: &str = r"\\.\pipe\";
const CONSOLE_NAMES: &[&str] = &["con", "conin$", "conout$", r"\\.\con", r"\\.\conin$", r"\\.\conout$"];

/// Directories a classifier is built from.
#[derive(Debug, Clone, Default)]
pub struct ClassifierRoots {
    /// Windows and system directories.
    pub system: Vec<String>,
    /// TEMP / TMP.
    pub temp: Vec<String>,
    /// Paths of the standard handles this process inherited.
    pub stdio: Vec<String>,
}

/// Classifies real paths once, at first sight. Roots are stored folded and
/// without a trailing separator.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    system: Vec<String>,
    temp: Vec<String>,
    stdio: Vec<String>,
}

fn prepare(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| fold(&normalize(p, None)).trim_end_matches('\\').to_string())
        .collect()
}

fn under_root(path: &str, root: &str) -> bool {
    !root.is_empty()
        && path.starts_with(root)
        && matches!(path.as_bytes().get(root.len()), None | Some(b'\\'))
}

/// `\\.\C:`, `\\?\Volume{...}`, `\\.\PhysicalDrive0` or a bare `C:`.
fn is_volume(folded: &str) -> bool {
    let b = folded.as_bytes();
    let bare_drive = |b: &[u8]| b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':';
    bare_drive(b)
        || folded.strip_prefix(r"\\.\").is_some_and(|rest| {
            bare_drive(rest.trim_end_matches('\\').as_bytes()) || rest.starts_with("physicaldrive")
        })
        || folded.starts_with(r"\\?\volume{")
}

impl Classifier {
    pub fn new(roots: &ClassifierRoots) -> Self {
        Self {
            system: prepare(&roots.system),
            temp: prepare(&roots.temp),
            stdio: prepare(&roots.stdio),
        }
    }

    pub fn classify(&self, real_path: &str) -> FileFlags {
        let folded = fold(real_path);
        let path = folded.as_str();
        let mut flags = FileFlags::empty();

        if path.starts_with(PIPE_PREFIX) {
            flags |= FileFlags::PIPE;
        }
        if is_volume(path) {
            flags |= FileFlags::VOLUME;
        }
        if CONSOLE_NAMES.contains(&path) || self.stdio.iter().any(|s| s == path) {
            flags |= FileFlags::STDIO;
        }
        if self.system.iter().any(|root| under_root(path, root)) {
            flags |= FileFlags::SYSTEM_PATH;
        }
        if self.temp.iter().any(|root| under_root(path, root)) {
            flags |= FileFlags::TEMPORARY_PATH;
        }
        if path.ends_with(".tmp") {
            flags |= FileFlags::TEMPORARY_FILE;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&ClassifierRoots {
            system: vec![r"C:\Windows".into(), r"C:\Windows\System32\".into()],
            temp: vec![r"C:\Users\dev\AppData\Local\Temp\".into()],
            stdio: vec![r"C:\build\log.txt".into()],
        })
    }

    #[test]
    fn test_system_paths() {
        let c = classifier();
        assert!(c.classify(r"C:\WINDOWS\system32\kernel32.dll").contains(FileFlags::SYSTEM_PATH));
        assert!(c.classify(r"C:\Windows").contains(FileFlags::SYSTEM_PATH));
        assert!(!c.classify(r"C:\WindowsApps\x.exe").contains(FileFlags::SYSTEM_PATH));
        assert!(!c.classify(r"C:\src\main.c").contains(FileFlags::SYSTEM_PATH));
    }

    #[test]
    fn test_temporary_paths_and_files() {
        let c = classifier();
        let flags = c.classify(r"C:\Users\dev\AppData\Local\Temp\cl123.rsp");
        assert!(flags.contains(FileFlags::TEMPORARY_PATH));
        assert!(!flags.contains(FileFlags::TEMPORARY_FILE));
        let flags = c.classify(r"C:\obj\x.TMP");
        assert_eq!(flags, FileFlags::TEMPORARY_FILE);
    }

    #[test]
    fn test_pipes_volumes_and_stdio() {
        let c = classifier();
        assert_eq!(c.classify(r"\\.\pipe\mspdb"), FileFlags::PIPE);
        assert_eq!(c.classify(r"\\.\C:"), FileFlags::VOLUME);
        assert_eq!(c.classify("D:"), FileFlags::VOLUME);
        assert_eq!(c.classify(r"\\?\Volume{abc}\"), FileFlags::VOLUME);
        assert_eq!(c.classify(r"\\.\PhysicalDrive0"), FileFlags::VOLUME);
        assert_eq!(c.classify("CONOUT$"), FileFlags::STDIO);
        assert_eq!(c.classify(r"C:\Build\LOG.txt"), FileFlags::STDIO);
        assert_eq!(c.classify(r"C:\src\a.c"), FileFlags::empty());
    }
}
