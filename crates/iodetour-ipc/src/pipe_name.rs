//! Trace pipe naming.

/// Namespace prefix of every trace pipe.
pub const PIPE_PREFIX: &str = r"\\.\pipe\iodetour-";

const ID_LEN: usize = 16;
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Derive a 16-character `[0-9A-Za-z]` run id from launch-time inputs.
pub fn unique_pipe_id(ticks: u64, pid: u32, command_line: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&ticks.to_le_bytes());
    hasher.update(&pid.to_le_bytes());
    hasher.update(command_line.as_bytes());
    let digest = hasher.finalize();
    digest.as_bytes()[..ID_LEN]
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect()
}

/// Full pipe path a detoured process connects to.
pub fn pipe_name(id: &str, trace_process_id: u32) -> String {
    format!("{PIPE_PREFIX}{id}-{trace_process_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_shape() {
        let id = unique_pipe_id(123_456, 42, "cl.exe /c main.c");
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_unique_id_depends_on_inputs() {
        let a = unique_pipe_id(1, 42, "cl.exe");
        assert_eq!(a, unique_pipe_id(1, 42, "cl.exe"));
        assert_ne!(a, unique_pipe_id(2, 42, "cl.exe"));
        assert_ne!(a, unique_pipe_id(1, 43, "cl.exe"));
        assert_ne!(a, unique_pipe_id(1, 42, "link.exe"));
    }

    #[test]
    fn test_pipe_name_format() {
        assert_eq!(pipe_name("Ab12", 7), r"\\.\pipe\iodetour-Ab12-7");
    }
}
