//! Trace record protocol for the named pipe
//!
//! Record format (one pipe message per record):
//! ```text
//! ┌──────────────────┐
//! │ length: u32 (LE) │  <- body length in bytes
//! │ access: u8       │  <- '0'..='7', see [`crate::access`]
//! │ path...          │  <- UTF-8, no terminator
//! └──────────────────┘
//! ```
//!
//! A body that starts with a tag letter instead of an access character is a
//! control message (see [`TraceMessage`]):
//!
//! | Tag | Body after the tag            |
//! |-----|-------------------------------|
//! | `H` | sender's ancestry label       |
//! | `S` | ancestry label of a new child |
//! | `O` | access char + path            |
//! | `F` | nothing                       |
//!
//! A zero-length message is the graceful end-of-connection sentinel.

use crate::access::{access_to_char, char_to_access, Access};
use crate::error::WireError;

/// Record header size in bytes (body length prefix)
pub const HEADER_SIZE: usize = 4;

/// Largest message either side will produce or accept.
/// Covers a 32767-unit extended-length path encoded as UTF-8.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024;

pub const TAG_HELLO: u8 = b'H';
pub const TAG_SPAWNED: u8 = b'S';
pub const TAG_OBSERVED: u8 = b'O';
pub const TAG_FINAL: u8 = b'F';

/// A decoded record borrowing from the received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord<'a> {
    pub access: Access,
    pub access_char: u8,
    pub path: &'a str,
}

impl<'a> TraceRecord<'a> {
    pub fn new(access: Access, path: &'a str) -> Self {
        Self {
            access,
            access_char: access_to_char(access),
            path,
        }
    }

    /// Dependency-file line body: access character followed by the path.
    pub fn write_line<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&[self.access_char])?;
        out.write_all(self.path.as_bytes())?;
        out.write_all(b"\n")
    }
}

/// Any message a trace client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMessage<'a> {
    /// A line of the process's final dependency list.
    Record(TraceRecord<'a>),
    /// A line streamed while the process runs. Only used when the process
    /// ends without delivering its final list.
    Observed(TraceRecord<'a>),
    /// First message on a connection: the sender's ancestry label.
    Hello(&'a str),
    /// The sender handed a payload to the child with this ancestry label.
    Spawned(&'a str),
    /// The sender's final list follows.
    FinalRecords,
}

/// Encode a record into `buf`, returning the message length.
pub fn encode_record(access: Access, path: &str, buf: &mut [u8]) -> Result<usize, WireError> {
    encode_message(&TraceMessage::Record(TraceRecord::new(access, path)), buf)
}

/// Encode any message into `buf`, returning the message length.
pub fn encode_message(message: &TraceMessage<'_>, buf: &mut [u8]) -> Result<usize, WireError> {
    let (prefix, text): ([Option<u8>; 2], &str) = match *message {
        TraceMessage::Record(r) => ([Some(r.access_char), None], r.path),
        TraceMessage::Observed(r) => ([Some(TAG_OBSERVED), Some(r.access_char)], r.path),
        TraceMessage::Hello(label) => ([Some(TAG_HELLO), None], label),
        TraceMessage::Spawned(label) => ([Some(TAG_SPAWNED), None], label),
        TraceMessage::FinalRecords => ([Some(TAG_FINAL), None], ""),
    };
    let prefix_len = prefix.iter().flatten().count();
    let body = prefix_len + text.len();
    let total = HEADER_SIZE + body;
    if total > MAX_MESSAGE_SIZE || total > buf.len() {
        return Err(WireError::TooLong(total));
    }
    buf[..HEADER_SIZE].copy_from_slice(&(body as u32).to_le_bytes());
    for (slot, byte) in buf[HEADER_SIZE..].iter_mut().zip(prefix.iter().flatten()) {
        *slot = *byte;
    }
    buf[HEADER_SIZE + prefix_len..total].copy_from_slice(text.as_bytes());
    Ok(total)
}

/// Check the length prefix and return the body.
fn body_of(bytes: &[u8]) -> Result<&[u8], WireError> {
    if bytes.len() <= HEADER_SIZE {
        return Err(WireError::TooShort(bytes.len()));
    }
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLong(bytes.len()));
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[HEADER_SIZE..];
    if declared != body.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

fn text_of(raw: &[u8]) -> Result<&str, WireError> {
    // Tolerate a trailing NUL from C-string style writers.
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)
}

fn record_of(body: &[u8]) -> Result<TraceRecord<'_>, WireError> {
    let (&access_char, rest) = body.split_first().ok_or(WireError::TooShort(HEADER_SIZE + 1))?;
    let access = char_to_access(access_char).ok_or(WireError::BadAccessChar(access_char))?;
    Ok(TraceRecord {
        access,
        access_char,
        path: text_of(rest)?,
    })
}

/// Decode one received message that must be a plain record.
pub fn decode_record(bytes: &[u8]) -> Result<TraceRecord<'_>, WireError> {
    record_of(body_of(bytes)?)
}

/// Decode one received message of any kind.
pub fn decode_message(bytes: &[u8]) -> Result<TraceMessage<'_>, WireError> {
    let body = body_of(bytes)?;
    let rest = &body[1..];
    Ok(match body[0] {
        TAG_HELLO => TraceMessage::Hello(text_of(rest)?),
        TAG_SPAWNED => TraceMessage::Spawned(text_of(rest)?),
        TAG_OBSERVED => TraceMessage::Observed(record_of(rest)?),
        TAG_FINAL => TraceMessage::FinalRecords,
        _ => TraceMessage::Record(record_of(body)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut buf = [0u8; 256];
        let n = encode_record(Access::new(true, true, false), r"C:\src\main.c", &mut buf).unwrap();
        let rec = decode_record(&buf[..n]).unwrap();
        assert_eq!(rec.access, Access::new(true, true, false));
        assert_eq!(rec.access_char, b'3');
        assert_eq!(rec.path, r"C:\src\main.c");
    }

    #[test]
    fn test_rejects_header_only_and_sentinel() {
        assert_eq!(decode_record(&[]), Err(WireError::TooShort(0)));
        assert_eq!(decode_record(&[0, 0, 0, 0]), Err(WireError::TooShort(4)));
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let msg = [9u8, 0, 0, 0, b'1', b'a'];
        assert_eq!(
            decode_record(&msg),
            Err(WireError::LengthMismatch {
                declared: 9,
                actual: 2
            })
        );
    }

    #[test]
    fn test_rejects_bad_access_char() {
        let msg = [2u8, 0, 0, 0, b'x', b'a'];
        assert_eq!(decode_record(&msg), Err(WireError::BadAccessChar(b'x')));
    }

    #[test]
    fn test_trailing_nul_is_stripped() {
        let msg = [3u8, 0, 0, 0, b'2', b'a', 0];
        assert_eq!(decode_record(&msg).unwrap().path, "a");
    }

    #[test]
    fn test_write_line() {
        let mut buf = [0u8; 64];
        let n = encode_record(Access::WRITE, r"D:\out.txt", &mut buf).unwrap();
        let mut out = Vec::new();
        decode_record(&buf[..n]).unwrap().write_line(&mut out).unwrap();
        assert_eq!(out, b"2D:\\out.txt\n");
    }

    #[test]
    fn test_encode_rejects_small_buffer() {
        let mut buf = [0u8; 8];
        assert!(matches!(
            encode_record(Access::READ, "0123456789", &mut buf),
            Err(WireError::TooLong(15))
        ));
    }

    #[test]
    fn test_control_messages() {
        let mut buf = [0u8; 64];
        for message in [
            TraceMessage::Hello("1.2."),
            TraceMessage::Spawned("1.2.3."),
            TraceMessage::FinalRecords,
            TraceMessage::Observed(TraceRecord::new(Access::READ, r"C:\a.h")),
            TraceMessage::Record(TraceRecord::new(Access::WRITE, r"C:\a.obj")),
        ] {
            let n = encode_message(&message, &mut buf).unwrap();
            assert_eq!(decode_message(&buf[..n]).unwrap(), message);
        }
    }

    #[test]
    fn test_observed_wire_layout() {
        let mut buf = [0u8; 64];
        let n = encode_message(
            &TraceMessage::Observed(TraceRecord::new(Access::READ, "a")),
            &mut buf,
        )
        .unwrap();
        assert_eq!(&buf[..n], &[3, 0, 0, 0, b'O', b'1', b'a']);
    }

    #[test]
    fn test_control_message_is_not_a_record() {
        let msg = [5u8, 0, 0, 0, b'H', b'1', b'.', b'2', b'.'];
        assert_eq!(decode_record(&msg), Err(WireError::BadAccessChar(b'H')));
        assert_eq!(decode_message(&msg), Ok(TraceMessage::Hello("1.2.")));
    }

    #[test]
    fn test_observed_without_access_is_rejected() {
        let msg = [1u8, 0, 0, 0, b'O'];
        assert!(decode_message(&msg).is_err());
        let msg = [2u8, 0, 0, 0, b'O', b'z'];
        assert_eq!(decode_message(&msg), Err(WireError::BadAccessChar(b'z')));
    }
}
