//! Payload copied into every detoured process.
//!
//! [`Payload`] is the owned form all code works with. [`PayloadBlock`] is the
//! fixed-size, relocation-free wire block that is copied into a child's
//! address space before it runs. Strings are UTF-16, lists are
//! NUL-separated and double-NUL terminated, mount pairs are interleaved
//! `input, real, input, real, ...`.

use crate::error::PayloadError;
use crate::options::Options;

/// Identifies a payload block in a foreign address space.
pub const PAYLOAD_GUID: [u8; 16] = [
    0x6b, 0x2d, 0x91, 0x3f, 0x0e, 0x47, 0x4c, 0x52, 0x9a, 0x1d, 0xc4, 0x7e, 0x25, 0x83, 0xf0, 0x11,
];

/// "IODT"
pub const PAYLOAD_MAGIC: u32 = 0x5444_4F49;
pub const PAYLOAD_VERSION: u32 = 1;

/// Maximum spawn depth recorded in the ancestry chain.
pub const MAX_ANCESTRY: usize = 64;

const PIPE_ID_UNITS: usize = 64;
const STD_PATH_UNITS: usize = 1024;
const LIST_UNITS: usize = 8192;

/// One `input prefix -> real prefix` remapping rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPath {
    pub input: String,
    pub real: String,
}

impl MountedPath {
    pub fn new(input: impl Into<String>, real: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            real: real.into(),
        }
    }
}

/// A standard handle a child inherits, as tracked by the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedStd {
    pub path: String,
    pub append: bool,
}

/// Standard handles handed to a new child. `None` means the handle was not
/// inheritable or not tracked, so there is nothing to classify as stdio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioInheritance {
    pub stdin: Option<InheritedStd>,
    pub stdout: Option<InheritedStd>,
    pub stderr: Option<InheritedStd>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub named_pipe_id: String,
    pub ignored_applications: Vec<String>,
    pub mounted_paths: Vec<MountedPath>,
    pub ancestry: Vec<u32>,
    pub parent_process_id: u32,
    pub trace_process_id: u32,
    pub stdin_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub options: Options,
}

impl Payload {
    /// Root payload for one launcher run. The ancestry starts empty; the
    /// first [`Payload::for_child`] gives the root process generation 1.
    pub fn root(named_pipe_id: impl Into<String>, trace_process_id: u32) -> Self {
        Self {
            named_pipe_id: named_pipe_id.into(),
            trace_process_id,
            parent_process_id: trace_process_id,
            ..Default::default()
        }
    }

    /// Generation id of the owning process (0 for the launcher).
    pub fn generation(&self) -> u32 {
        self.ancestry.last().copied().unwrap_or(0)
    }

    /// Id for the `spawned`-th child (1-based) of this process.
    /// Always greater than this process's own generation.
    pub fn next_generation(&self, spawned: u32) -> u32 {
        self.generation().saturating_add(spawned.max(1))
    }

    /// Clone this payload for a new child process.
    pub fn for_child(
        &self,
        generation: u32,
        parent_process_id: u32,
        stdio: &StdioInheritance,
    ) -> Result<Payload, PayloadError> {
        if self.ancestry.len() >= MAX_ANCESTRY {
            return Err(PayloadError::AncestryFull(MAX_ANCESTRY));
        }
        let last = self.generation();
        if generation <= last {
            return Err(PayloadError::NonMonotonicGeneration {
                last,
                next: generation,
            });
        }

        let mut child = self.clone();
        child.ancestry.push(generation);
        child.parent_process_id = parent_process_id;
        child.options = self.options.inheritable();

        let path_of = |s: &Option<InheritedStd>| s.as_ref().map(|s| s.path.clone()).unwrap_or_default();
        child.stdin_path = path_of(&stdio.stdin);
        child.stdout_path = path_of(&stdio.stdout);
        child.stderr_path = path_of(&stdio.stderr);
        if stdio.stdout.as_ref().is_some_and(|s| s.append) {
            child.options |= Options::APPEND_STDOUT;
        }
        if stdio.stderr.as_ref().is_some_and(|s| s.append) {
            child.options |= Options::APPEND_STDERR;
        }
        Ok(child)
    }

    /// Dotted lineage label, e.g. `"1.3.7."`.
    pub fn ancestry_label(&self) -> String {
        let mut label = String::with_capacity(self.ancestry.len() * 4);
        for generation in &self.ancestry {
            label.push_str(&generation.to_string());
            label.push('.');
        }
        label
    }

    /// Whether `executable` (a path or basename) is exempt from detouring.
    pub fn is_ignored_application(&self, executable: &str) -> bool {
        let base = executable
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(executable);
        self.ignored_applications
            .iter()
            .any(|app| app.eq_ignore_ascii_case(base))
    }

    /// Serialize into the fixed wire block.
    pub fn to_block(&self) -> Result<Box<PayloadBlock>, PayloadError> {
        if self.ancestry.len() > MAX_ANCESTRY {
            return Err(PayloadError::AncestryFull(MAX_ANCESTRY));
        }
        let mut block = PayloadBlock::new_boxed();
        block.options = self.options.bits();
        block.parent_process_id = self.parent_process_id;
        block.trace_process_id = self.trace_process_id;
        block.ancestry_count = self.ancestry.len() as u32;
        block.ancestry[..self.ancestry.len()].copy_from_slice(&self.ancestry);

        write_str(&mut block.named_pipe, "named_pipe", &self.named_pipe_id)?;
        write_str(&mut block.stdin_path, "stdin_path", &self.stdin_path)?;
        write_str(&mut block.stdout_path, "stdout_path", &self.stdout_path)?;
        write_str(&mut block.stderr_path, "stderr_path", &self.stderr_path)?;
        write_list(
            &mut block.ignored_applications,
            "ignored_applications",
            self.ignored_applications.iter().map(String::as_str),
        )?;
        write_list(
            &mut block.mounted_paths,
            "mounted_paths",
            self.mounted_paths
                .iter()
                .flat_map(|m| [m.input.as_str(), m.real.as_str()]),
        )?;
        Ok(block)
    }

    /// Deserialize and validate a wire block.
    pub fn from_block(block: &PayloadBlock) -> Result<Payload, PayloadError> {
        block.validate()?;
        let count = block.ancestry_count as usize;
        let flat = read_list(&block.mounted_paths)?;
        if flat.len() % 2 != 0 {
            return Err(PayloadError::Corrupt("unpaired mounted path"));
        }
        let mounted_paths = flat
            .chunks_exact(2)
            .map(|pair| MountedPath::new(pair[0].clone(), pair[1].clone()))
            .collect();

        Ok(Payload {
            named_pipe_id: read_str(&block.named_pipe),
            ignored_applications: read_list(&block.ignored_applications)?,
            mounted_paths,
            ancestry: block.ancestry[..count].to_vec(),
            parent_process_id: block.parent_process_id,
            trace_process_id: block.trace_process_id,
            stdin_path: read_str(&block.stdin_path),
            stdout_path: read_str(&block.stdout_path),
            stderr_path: read_str(&block.stderr_path),
            options: Options::from_bits_truncate(block.options),
        })
    }
}

/// Fixed-size POD block. Field order keeps every field naturally aligned,
/// so the struct has no padding and any byte pattern is a valid value.
#[repr(C)]
pub struct PayloadBlock {
    pub guid: [u8; 16],
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub options: u32,
    /// Handle value of the payload mapping inside the receiving process,
    /// filled in by the copier so the child can release it.
    pub transport_handle: u64,
    pub parent_process_id: u32,
    pub trace_process_id: u32,
    pub ancestry_count: u32,
    pub reserved: u32,
    pub ancestry: [u32; MAX_ANCESTRY],
    pub named_pipe: [u16; PIPE_ID_UNITS],
    pub stdin_path: [u16; STD_PATH_UNITS],
    pub stdout_path: [u16; STD_PATH_UNITS],
    pub stderr_path: [u16; STD_PATH_UNITS],
    pub ignored_applications: [u16; LIST_UNITS],
    pub mounted_paths: [u16; LIST_UNITS],
}

impl PayloadBlock {
    pub const SIZE: usize = std::mem::size_of::<PayloadBlock>();

    /// Allocate a zeroed block directly on the heap (it is too large for
    /// the small stacks hooked threads may run on).
    pub fn new_boxed() -> Box<PayloadBlock> {
        let layout = std::alloc::Layout::new::<PayloadBlock>();
        // SAFETY: PayloadBlock is plain integers, so all-zero is a valid value.
        let mut block = unsafe {
            let ptr = std::alloc::alloc_zeroed(layout) as *mut PayloadBlock;
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        };
        block.guid = PAYLOAD_GUID;
        block.magic = PAYLOAD_MAGIC;
        block.version = PAYLOAD_VERSION;
        block.block_size = Self::SIZE as u32;
        block
    }

    /// Raw bytes for copying across a process boundary.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) without padding; every byte is initialized.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }

    /// Rebuild a block from copied bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Box<PayloadBlock>, PayloadError> {
        if bytes.len() != Self::SIZE {
            return Err(PayloadError::SizeMismatch {
                expected: Self::SIZE,
                found: bytes.len(),
            });
        }
        let mut block = Self::new_boxed();
        // SAFETY: sizes match and any byte pattern is a valid PayloadBlock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut *block as *mut PayloadBlock as *mut u8,
                Self::SIZE,
            );
        }
        block.validate()?;
        Ok(block)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.guid != PAYLOAD_GUID {
            return Err(PayloadError::BadGuid);
        }
        if self.magic != PAYLOAD_MAGIC {
            return Err(PayloadError::Corrupt("bad magic"));
        }
        if self.version != PAYLOAD_VERSION {
            return Err(PayloadError::VersionMismatch(self.version));
        }
        if self.block_size as usize != Self::SIZE {
            return Err(PayloadError::SizeMismatch {
                expected: Self::SIZE,
                found: self.block_size as usize,
            });
        }
        if self.ancestry_count as usize > MAX_ANCESTRY {
            return Err(PayloadError::Corrupt("ancestry count out of range"));
        }
        Ok(())
    }
}

fn write_str(dst: &mut [u16], field: &'static str, s: &str) -> Result<(), PayloadError> {
    let len = s.encode_utf16().count();
    // Keep one unit for the terminator.
    if len >= dst.len() {
        return Err(PayloadError::FieldTooLong {
            field,
            len,
            max: dst.len() - 1,
        });
    }
    for (slot, unit) in dst.iter_mut().zip(s.encode_utf16()) {
        *slot = unit;
    }
    dst[len..].fill(0);
    Ok(())
}

fn read_str(src: &[u16]) -> String {
    let end = src.iter().position(|&u| u == 0).unwrap_or(src.len());
    String::from_utf16_lossy(&src[..end])
}

fn write_list<'a>(
    dst: &mut [u16],
    field: &'static str,
    items: impl Iterator<Item = &'a str>,
) -> Result<(), PayloadError> {
    let mut pos = 0;
    for item in items {
        let len = item.encode_utf16().count();
        // Entries must be non-empty, or the double NUL would end the list early.
        let units = len.max(1);
        if pos + units + 2 > dst.len() {
            return Err(PayloadError::FieldTooLong {
                field,
                len: pos + units + 2,
                max: dst.len(),
            });
        }
        if len == 0 {
            dst[pos] = u16::from(b'.');
        } else {
            for (slot, unit) in dst[pos..].iter_mut().zip(item.encode_utf16()) {
                *slot = unit;
            }
        }
        pos += units;
        dst[pos] = 0;
        pos += 1;
    }
    dst[pos..].fill(0);
    Ok(())
}

fn read_list(src: &[u16]) -> Result<Vec<String>, PayloadError> {
    let mut items = Vec::new();
    let mut rest = src;
    loop {
        let end = rest
            .iter()
            .position(|&u| u == 0)
            .ok_or(PayloadError::Corrupt("unterminated list"))?;
        if end == 0 {
            return Ok(items);
        }
        items.push(String::from_utf16_lossy(&rest[..end]));
        rest = &rest[end + 1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Payload {
        Payload {
            named_pipe_id: "Ab3xYz".into(),
            ignored_applications: vec!["mspdbsrv.exe".into(), "conhost.exe".into()],
            mounted_paths: vec![
                MountedPath::new(r"X:\src", r"C:\work\src"),
                MountedPath::new(r"Y:\", r"D:\cache\"),
            ],
            ancestry: vec![1, 3],
            parent_process_id: 100,
            trace_process_id: 42,
            stdin_path: String::new(),
            stdout_path: r"C:\logs\out.txt".into(),
            stderr_path: String::new(),
            options: Options::IGNORE_SYSTEM | Options::APPEND_STDOUT,
        }
    }

    #[test]
    fn test_block_has_no_padding() {
        let fields = 16
            + 4 * 8
            + 8
            + 4 * MAX_ANCESTRY
            + 2 * (PIPE_ID_UNITS + 3 * STD_PATH_UNITS + 2 * LIST_UNITS);
        assert_eq!(PayloadBlock::SIZE, fields);
    }

    #[test]
    fn test_block_preserves_payload() {
        let payload = sample();
        let block = payload.to_block().unwrap();
        let copied = PayloadBlock::from_bytes(block.as_bytes()).unwrap();
        assert_eq!(Payload::from_block(&copied).unwrap(), payload);
    }

    #[test]
    fn test_from_bytes_rejects_foreign_block() {
        let block = sample().to_block().unwrap();
        let mut bytes = block.as_bytes().to_vec();
        bytes[0] ^= 0xff;
        assert!(matches!(
            PayloadBlock::from_bytes(&bytes),
            Err(PayloadError::BadGuid)
        ));
        assert!(matches!(
            PayloadBlock::from_bytes(&bytes[1..]),
            Err(PayloadError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_to_block_rejects_long_pipe_id() {
        let mut payload = sample();
        payload.named_pipe_id = "x".repeat(PIPE_ID_UNITS);
        assert!(matches!(
            payload.to_block(),
            Err(PayloadError::FieldTooLong {
                field: "named_pipe",
                ..
            })
        ));
    }

    #[test]
    fn test_child_chain_grows_ancestry() {
        let mut payload = Payload::root("pipe", 42);
        for n in 1..=5u32 {
            let generation = payload.next_generation(n);
            payload = payload
                .for_child(generation, 1000 + n, &StdioInheritance::default())
                .unwrap();
            assert_eq!(payload.ancestry.len(), n as usize);
        }
        assert!(payload.ancestry.windows(2).all(|w| w[0] < w[1]));
        let label = payload.ancestry_label();
        assert_eq!(label.matches('.').count(), 5);
        assert!(label.ends_with('.'));
    }

    #[test]
    fn test_for_child_rewrites_stdio_and_append() {
        let parent = sample();
        let stdio = StdioInheritance {
            stdin: None,
            stdout: Some(InheritedStd {
                path: r"C:\build\log.txt".into(),
                append: false,
            }),
            stderr: Some(InheritedStd {
                path: r"C:\build\err.txt".into(),
                append: true,
            }),
        };
        let child = parent.for_child(7, 555, &stdio).unwrap();
        assert_eq!(child.ancestry, vec![1, 3, 7]);
        assert_eq!(child.parent_process_id, 555);
        assert_eq!(child.stdin_path, "");
        assert_eq!(child.stdout_path, r"C:\build\log.txt");
        assert_eq!(child.stderr_path, r"C:\build\err.txt");
        assert!(child.options.contains(Options::IGNORE_SYSTEM));
        assert!(!child.options.contains(Options::APPEND_STDOUT));
        assert!(child.options.contains(Options::APPEND_STDERR));
        assert_eq!(child.ancestry_label(), "1.3.7.");
    }

    #[test]
    fn test_for_child_rejects_stale_generation() {
        let parent = sample();
        assert_eq!(
            parent.for_child(3, 1, &StdioInheritance::default()),
            Err(PayloadError::NonMonotonicGeneration { last: 3, next: 3 })
        );
    }

    #[test]
    fn test_ancestry_is_bounded() {
        let mut payload = Payload::root("pipe", 1);
        payload.ancestry = (1..=MAX_ANCESTRY as u32).collect();
        assert_eq!(
            payload.for_child(10_000, 1, &StdioInheritance::default()),
            Err(PayloadError::AncestryFull(MAX_ANCESTRY))
        );
    }

    #[test]
    fn test_ignored_application_matches_basename() {
        let payload = sample();
        assert!(payload.is_ignored_application(r"C:\VS\bin\MSPDBSRV.EXE"));
        assert!(payload.is_ignored_application("conhost.exe"));
        assert!(!payload.is_ignored_application(r"C:\tools\cl.exe"));
    }

    #[test]
    fn test_empty_list_entries_do_not_truncate() {
        let mut payload = sample();
        payload.mounted_paths = vec![MountedPath::new("", r"C:\x"), MountedPath::new("a", "b")];
        let block = payload.to_block().unwrap();
        let back = Payload::from_block(&block).unwrap();
        assert_eq!(back.mounted_paths.len(), 2);
        assert_eq!(back.mounted_paths[1], MountedPath::new("a", "b"));
    }
}
