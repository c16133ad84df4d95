//! # iodetour-ipc
//!
//! Everything that crosses a process boundary in an iodetour run.
//!
//! # Architecture
//!
//! - [`Payload`] / [`PayloadBlock`] - configuration copied into every detoured
//!   process before it runs any of its own code
//! - [`message`] - the trace record carried over the named pipe
//! - [`TraceChannel`] - the per-process pipe client that serializes records
//!   and mints payloads for children
//! - `windows` - named-pipe transport, payload mapping and DLL injection
//!   (Windows only)

pub mod access;
pub mod channel;
pub mod error;
pub mod message;
pub mod options;
pub mod payload;
pub mod pipe_name;
#[cfg(windows)]
pub mod windows;

pub use access::{access_to_char, char_to_access, Access};
pub use channel::{
    ChannelState, ChildTarget, Connector, PayloadCopier, TraceChannel, Transport,
    OPEN_ATTEMPTS, OPEN_WAIT_MS,
};
pub use error::{ChannelError, PayloadError, TransportError, WireError};
pub use message::{
    decode_message, decode_record, encode_message, encode_record, TraceMessage, TraceRecord,
    HEADER_SIZE, MAX_MESSAGE_SIZE, TAG_FINAL, TAG_HELLO, TAG_OBSERVED, TAG_SPAWNED,
};
pub use options::Options;
pub use payload::{
    InheritedStd, MountedPath, Payload, PayloadBlock, StdioInheritance, MAX_ANCESTRY,
    PAYLOAD_GUID,
};
pub use pipe_name::{pipe_name, unique_pipe_id, PIPE_PREFIX};

/// Exit code of a detoured process that could not reach its launcher.
pub const EXIT_CHANNEL_OPEN_FAILED: u32 = 0xD0D0_0001;

/// Exit code of a detoured process whose trace pipe broke mid-run.
pub const EXIT_CHANNEL_WRITE_FAILED: u32 = 0xD0D0_0002;
