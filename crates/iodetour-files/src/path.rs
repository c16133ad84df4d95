//! Lexical Win32 path handling.
//!
//! Everything here works on `&str` so it behaves the same on every host;
//! nothing touches the file system.

use iodetour_ipc::MountedPath;

const SEP: char = '\\';

/// Names the Win32 layer maps to devices regardless of the current directory.
const DEVICE_NAMES: &[&str] = &["con", "conin$", "conout$", "nul", "aux", "prn"];

fn is_drive_letter(b: &[u8]) -> bool {
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

/// Whether `path` can be normalized without the current directory.
pub fn is_fully_qualified(path: &str) -> bool {
    let b = path.as_bytes();
    let sep = |c: u8| c == b'\\' || c == b'/';
    (b.len() >= 2 && sep(b[0]) && sep(b[1]))
        || (b.len() >= 3 && is_drive_letter(b) && sep(b[2]))
        || (b.len() == 2 && is_drive_letter(b))
        || DEVICE_NAMES.iter().any(|d| path.eq_ignore_ascii_case(d))
}

/// Case-folded comparison key.
pub fn fold(path: &str) -> String {
    let mut key = String::with_capacity(path.len());
    fold_into(path, &mut key);
    key
}

/// [`fold`] into a reused buffer.
pub fn fold_into(path: &str, out: &mut String) {
    out.clear();
    if path.is_ascii() {
        out.push_str(path);
        out.make_ascii_lowercase();
    } else {
        out.extend(path.chars().flat_map(char::to_lowercase));
    }
}

/// Strip `prefix` from `path`, comparing case-insensitively.
/// Returns the remainder of `path` (original case).
pub fn strip_prefix_ci<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path.is_ascii() && prefix.is_ascii() {
        let head = path.get(..prefix.len())?;
        return head.eq_ignore_ascii_case(prefix).then(|| &path[prefix.len()..]);
    }
    let mut rest = path.char_indices();
    for p in prefix.chars() {
        let (_, c) = rest.next()?;
        if !c.to_lowercase().eq(p.to_lowercase()) {
            return None;
        }
    }
    Some(rest.as_str())
}

/// Like [`strip_prefix_ci`], but only on a path component boundary.
pub fn strip_component_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = strip_prefix_ci(path, prefix)?;
    if prefix.ends_with(SEP) || rest.is_empty() || rest.starts_with(SEP) {
        Some(rest)
    } else {
        None
    }
}

/// Normalize a Win32 path to absolute form.
///
/// - `/` becomes `\`
/// - `\\?\C:\x` and `\??\C:\x` become `C:\x`, `\\?\UNC\s\x` becomes `\\s\x`
/// - device paths (`\\.\...`, `\\?\Volume{...}`), bare device names and bare
///   drives (`C:`) are returned unchanged
/// - relative, rooted and drive-relative paths are resolved against `cwd`
/// - `.`, `..` and repeated separators are collapsed
pub fn normalize(path: &str, cwd: Option<&str>) -> String {
    let mut p = path.replace('/', "\\");

    if let Some(rest) = strip_prefix_ci(&p, r"\\?\UNC\") {
        p = format!(r"\\{rest}");
    } else if let Some(rest) = p.strip_prefix(r"\\?\").or_else(|| p.strip_prefix(r"\??\")) {
        if strip_prefix_ci(rest, "volume{").is_some() {
            return p;
        }
        p = rest.to_string();
    }
    if p.starts_with(r"\\.\") {
        return p;
    }
    if DEVICE_NAMES.iter().any(|d| p.eq_ignore_ascii_case(d)) {
        return p;
    }
    let b = p.as_bytes();
    if b.len() == 2 && is_drive_letter(b) {
        return p;
    }

    let cwd = cwd.map(|c| c.replace('/', "\\")).unwrap_or_default();
    let absolute = if p.starts_with(r"\\") || (is_drive_letter(b) && b.get(2) == Some(&b'\\')) {
        p
    } else if is_drive_letter(b) {
        // Drive-relative: only meaningful against a cwd on the same drive.
        let drive = &p[..2];
        let rel = &p[2..];
        if cwd.get(..2).is_some_and(|d| d.eq_ignore_ascii_case(drive)) {
            format!(r"{cwd}\{rel}")
        } else {
            format!(r"{drive}\{rel}")
        }
    } else if p.starts_with(SEP) {
        format!("{}{p}", split_root(&cwd).0)
    } else if cwd.is_empty() {
        p
    } else {
        format!(r"{cwd}\{p}")
    };

    collapse(&absolute)
}

/// Split off the root: `C:` or `\\server\share`. Unrooted paths get "".
fn split_root(path: &str) -> (&str, &str) {
    let b = path.as_bytes();
    if is_drive_letter(b) {
        return path.split_at(2);
    }
    if let Some(unc) = path.strip_prefix(r"\\") {
        let mut seps = unc.match_indices(SEP).map(|(i, _)| i);
        let end = match (seps.next(), seps.next()) {
            (Some(_), Some(second)) => 2 + second,
            _ => path.len(),
        };
        return path.split_at(end);
    }
    ("", path)
}

fn collapse(path: &str) -> String {
    let (root, rest) = split_root(path);
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(SEP) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push_str(root);
    for part in &parts {
        if !out.is_empty() || !root.is_empty() {
            out.push(SEP);
        }
        out.push_str(part);
    }
    if parts.is_empty() && is_drive_letter(root.as_bytes()) {
        out.push(SEP);
    }
    out
}

/// Mount table with its prefixes pre-normalized.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    rules: Vec<MountedPath>,
}

impl MountTable {
    pub fn new(rules: &[MountedPath]) -> Self {
        let rules = rules
            .iter()
            .filter(|m| !m.input.is_empty())
            .map(|m| MountedPath::new(normalize(&m.input, None), normalize(&m.real, None)))
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite `path` with the first rule, in declaration order, whose input
    /// prefix matches on a component boundary. Overlapping rules are not
    /// reordered: an earlier, shorter prefix shadows a later, longer one.
    pub fn remap(&self, path: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            let rest = strip_component_prefix(path, &rule.input)?;
            let rest = rest.trim_start_matches(SEP);
            if rest.is_empty() {
                return Some(rule.real.clone());
            }
            let real = rule.real.trim_end_matches(SEP);
            Some(format!(r"{real}\{rest}"))
        })
    }
}

/// Executable named by the first token of a Win32 command line. A quoted
/// token runs to the closing quote; an unquoted one to the first blank.
pub fn command_executable(command_line: &str) -> &str {
    let line = command_line.trim_start_matches([' ', '\t']);
    if let Some(quoted) = line.strip_prefix('"') {
        return quoted.split('"').next().unwrap_or(quoted);
    }
    line.split([' ', '\t']).next().unwrap_or(line)
}
