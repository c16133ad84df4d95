//! Ignore/append option bit-set carried in the payload.

use bitflags::bitflags;

bitflags! {
    /// Dump filters (`IGNORE_*`) and stdio propagation flags (`APPEND_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Options: u32 {
        const IGNORE_ABSORBED  = 1 << 0;
        const IGNORE_CLEANUP   = 1 << 1;
        const IGNORE_DELETE    = 1 << 2;
        const IGNORE_DIRECTORY = 1 << 3;
        const IGNORE_DO_NONE   = 1 << 4;
        const IGNORE_PIPE      = 1 << 5;
        const IGNORE_TEMPORARY = 1 << 6;
        const IGNORE_STDIO     = 1 << 7;
        const IGNORE_SYSTEM    = 1 << 8;
        const IGNORE_VOLUME    = 1 << 9;
        const APPEND_STDOUT    = 1 << 10;
        const APPEND_STDERR    = 1 << 11;
    }
}

const NAMES: &[(&str, Options)] = &[
    ("ignoreabsorbed", Options::IGNORE_ABSORBED),
    ("ignorecleanup", Options::IGNORE_CLEANUP),
    ("ignoredelete", Options::IGNORE_DELETE),
    ("ignoredirectory", Options::IGNORE_DIRECTORY),
    ("ignoredonone", Options::IGNORE_DO_NONE),
    ("ignorepipe", Options::IGNORE_PIPE),
    ("ignoretemporary", Options::IGNORE_TEMPORARY),
    ("ignorestdio", Options::IGNORE_STDIO),
    ("ignoresystem", Options::IGNORE_SYSTEM),
    ("ignorevolume", Options::IGNORE_VOLUME),
    ("appendstdout", Options::APPEND_STDOUT),
    ("appendstderr", Options::APPEND_STDERR),
];

impl Options {
    /// Every `IGNORE_*` flag.
    pub const IGNORE_ALL: Options = Options::from_bits_truncate((1 << 10) - 1);

    /// Parse one option name. Accepts `IgnoreSystem`, `ignore-system`,
    /// `IGNORE_SYSTEM` and `system` (shorthand for the ignore flag).
    pub fn parse_name(name: &str) -> Option<Options> {
        let folded: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        NAMES
            .iter()
            .find(|(n, _)| *n == folded || n.strip_prefix("ignore") == Some(folded.as_str()))
            .map(|(_, flag)| *flag)
    }

    /// Parse a `;`/`,` separated list, returning the first unknown name on error.
    pub fn parse_list(list: &str) -> Result<Options, String> {
        list.split([';', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .try_fold(Options::empty(), |acc, name| {
                Options::parse_name(name)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| name.to_string())
            })
    }

    /// Options a child inherits before its own stdio flags are decided.
    pub fn inheritable(self) -> Options {
        self - (Options::APPEND_STDOUT | Options::APPEND_STDERR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_spellings() {
        for spelling in ["IgnoreSystem", "ignore-system", "IGNORE_SYSTEM", "system"] {
            assert_eq!(Options::parse_name(spelling), Some(Options::IGNORE_SYSTEM));
        }
        assert_eq!(Options::parse_name("AppendStdout"), Some(Options::APPEND_STDOUT));
        assert_eq!(Options::parse_name("nonsense"), None);
    }

    #[test]
    fn test_parse_list() {
        let opts = Options::parse_list("IgnoreTemporary; ignore-pipe,volume").unwrap();
        assert_eq!(
            opts,
            Options::IGNORE_TEMPORARY | Options::IGNORE_PIPE | Options::IGNORE_VOLUME
        );
        assert_eq!(Options::parse_list("IgnoreStdio;bogus"), Err("bogus".into()));
        assert_eq!(Options::parse_list(""), Ok(Options::empty()));
    }

    #[test]
    fn test_ignore_all_excludes_append() {
        assert!(Options::IGNORE_ALL.contains(Options::IGNORE_VOLUME));
        assert!(!Options::IGNORE_ALL.contains(Options::APPEND_STDOUT));
        let all = Options::all();
        assert_eq!(all.inheritable(), Options::IGNORE_ALL);
    }
}
