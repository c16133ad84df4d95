//! Error types for iodetour IPC.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload field {field} does not fit ({len} > {max} units)")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("ancestry chain is full ({0} generations)")]
    AncestryFull(usize),

    #[error("generation {next} does not follow {last}")]
    NonMonotonicGeneration { last: u32, next: u32 },

    #[error("payload block has wrong size: expected {expected}, found {found}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("payload block GUID does not match")]
    BadGuid,

    #[error("payload block version {0} is not supported")]
    VersionMismatch(u32),

    #[error("payload block is corrupt: {0}")]
    Corrupt(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message of {0} bytes is shorter than a record")]
    TooShort(usize),

    #[error("record declares {declared} body bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid access character {0:#04x}")]
    BadAccessChar(u8),

    #[error("record path is not valid UTF-8")]
    InvalidUtf8,

    #[error("record of {0} bytes exceeds the message limit")]
    TooLong(usize),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} failed with Win32 error {code}")]
    Win32 { op: &'static str, code: u32 },

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("trace channel is not connected")]
    NotConnected,

    #[error("could not open trace pipe {pipe} after {attempts} attempts: {last}")]
    OpenExhausted {
        pipe: String,
        attempts: u32,
        last: std::io::Error,
    },

    #[error("trace pipe write failed: {0}")]
    WriteFailed(std::io::Error),

    #[error("trace message exceeds the channel buffer")]
    MessageTooLong,

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("payload copy failed: {0}")]
    Transport(#[from] TransportError),
}
