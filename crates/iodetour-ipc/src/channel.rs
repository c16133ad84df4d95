//! Per-process trace channel.
//!
//! One [`TraceChannel`] exists in every detoured process. It owns the client
//! end of the launcher's pipe and the process's copy of the payload.
//!
//! # Locking
//!
//! Writes and payload cloning take different locks, so a thread spawning a
//! child never stalls threads that are only reporting file accesses. Neither
//! lock is taken while the other is held.
//!
//! # Connection protocol
//!
//! The first message on a connection is a hello carrying the process's
//! ancestry label. Every child that receives a payload is announced with a
//! spawned notice before it can run, so the launcher keeps listening until
//! that child has connected too.

use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::access::{access_to_char, Access};
use crate::error::{ChannelError, TransportError};
use crate::message::{
    HEADER_SIZE, MAX_MESSAGE_SIZE, TAG_FINAL, TAG_HELLO, TAG_OBSERVED, TAG_SPAWNED,
};
use crate::options::Options;
use crate::payload::{Payload, PayloadBlock, StdioInheritance};
use crate::pipe_name::pipe_name;

/// Connection attempts before giving up on the launcher's pipe.
pub const OPEN_ATTEMPTS: u32 = 50;

/// Wait for a free pipe instance between attempts.
pub const OPEN_WAIT_MS: u32 = 200;

// ============================================================================
// Seams
// ============================================================================

/// Client end of the trace pipe. Each call writes one whole message.
pub trait Transport: Send {
    fn write_message(&mut self, message: &[u8]) -> io::Result<()>;
}

/// Opens transports to a named pipe.
pub trait Connector {
    type Transport: Transport;

    fn try_connect(&self, pipe: &str) -> io::Result<Self::Transport>;

    /// Block until an instance may be free or `timeout_ms` elapses.
    fn wait_available(&self, pipe: &str, timeout_ms: u32) -> bool;
}

/// Process that is about to receive a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildTarget {
    /// Raw process handle value with at least `PROCESS_DUP_HANDLE` access.
    pub process_handle: usize,
    pub process_id: u32,
}

/// Places a payload block where the target process will find it.
pub trait PayloadCopier {
    fn copy_payload(&self, target: &ChildTarget, block: &PayloadBlock)
        -> Result<(), TransportError>;
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Opening,
    Connected,
    Closed,
}

struct WriteSide<T> {
    state: ChannelState,
    transport: Option<T>,
    buf: Vec<u8>,
}

struct PayloadSide {
    payload: Payload,
    spawned: u32,
}

pub struct TraceChannel<T> {
    own_pid: u32,
    pipe: String,
    write: Mutex<WriteSide<T>>,
    payload: Mutex<PayloadSide>,
}

fn lock<G>(m: &Mutex<G>) -> MutexGuard<'_, G> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> TraceChannel<T> {
    pub fn new(payload: Payload, own_pid: u32) -> Self {
        let pipe = pipe_name(&payload.named_pipe_id, payload.trace_process_id);
        Self {
            own_pid,
            pipe,
            write: Mutex::new(WriteSide {
                state: ChannelState::Uninitialized,
                transport: None,
                buf: Vec::new(),
            }),
            payload: Mutex::new(PayloadSide {
                payload,
                spawned: 0,
            }),
        }
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.write).state
    }

    /// Snapshot of this process's payload.
    pub fn payload(&self) -> Payload {
        lock(&self.payload).payload.clone()
    }

    /// Ignore options this process reports under.
    pub fn options(&self) -> Options {
        lock(&self.payload).payload.options
    }

    /// Connect to the launcher's pipe, retrying while all instances are busy,
    /// and introduce this process by its ancestry label.
    pub fn open<C>(&self, connector: &C) -> Result<(), ChannelError>
    where
        C: Connector<Transport = T>,
    {
        let label = lock(&self.payload).payload.ancestry_label();
        let mut side = lock(&self.write);
        match side.state {
            ChannelState::Connected => return Ok(()),
            ChannelState::Closed => return Err(ChannelError::NotConnected),
            _ => {}
        }
        side.state = ChannelState::Opening;

        let mut last = None;
        for attempt in 1..=OPEN_ATTEMPTS {
            match connector.try_connect(&self.pipe) {
                Ok(transport) => {
                    side.transport = Some(transport);
                    side.buf = vec![0; MAX_MESSAGE_SIZE];
                    side.state = ChannelState::Connected;
                    Self::send(&mut side, format_args!("{}{}", TAG_HELLO as char, label))?;
                    debug!(pipe = %self.pipe, attempt, ancestry = %label, "trace channel connected");
                    return Ok(());
                }
                Err(e) => {
                    last = Some(e);
                    if attempt < OPEN_ATTEMPTS {
                        connector.wait_available(&self.pipe, OPEN_WAIT_MS);
                    }
                }
            }
        }

        side.state = ChannelState::Closed;
        Err(ChannelError::OpenExhausted {
            pipe: self.pipe.clone(),
            attempts: OPEN_ATTEMPTS,
            last: last.unwrap_or_else(|| io::Error::other("no connection attempt")),
        })
    }

    /// Format one record body and send it as a single message.
    pub fn printf(&self, args: fmt::Arguments<'_>) -> Result<(), ChannelError> {
        Self::send(&mut lock(&self.write), args)
    }

    /// Send one `<access char><path>` record of the final list.
    pub fn send_access(&self, access: Access, path: &str) -> Result<(), ChannelError> {
        self.printf(format_args!("{}{}", access_to_char(access) as char, path))
    }

    /// Stream an access while the process is still running. The launcher
    /// keeps it only if the final list never arrives.
    pub fn send_observed(&self, access: Access, path: &str) -> Result<(), ChannelError> {
        self.printf(format_args!(
            "{}{}{}",
            TAG_OBSERVED as char,
            access_to_char(access) as char,
            path
        ))
    }

    /// Announce that the final list follows.
    pub fn begin_final_records(&self) -> Result<(), ChannelError> {
        self.printf(format_args!("{}", TAG_FINAL as char))
    }

    /// Send the end-of-stream sentinel and drop the transport.
    pub fn close(&self) {
        let mut side = lock(&self.write);
        if side.state == ChannelState::Connected {
            if let Some(transport) = side.transport.as_mut() {
                if let Err(e) = transport.write_message(&[]) {
                    warn!(pipe = %self.pipe, error = %e, "failed to send close sentinel");
                }
            }
        }
        side.transport = None;
        side.state = ChannelState::Closed;
    }

    /// Mint the payload for a new child, hand it to `copier`, announce the
    /// child to the launcher and return its ancestry label.
    ///
    /// The child must not run before this returns.
    pub fn child_payload<P: PayloadCopier + ?Sized>(
        &self,
        copier: &P,
        target: &ChildTarget,
        stdio: &StdioInheritance,
    ) -> Result<String, ChannelError> {
        let label = {
            let mut side = lock(&self.payload);
            let spawned = side.spawned + 1;
            let generation = side.payload.next_generation(spawned);
            let child = side.payload.for_child(generation, self.own_pid, stdio)?;
            let block = child.to_block()?;
            copier.copy_payload(target, &block)?;
            side.spawned = spawned;
            child.ancestry_label()
        };
        debug!(child_pid = target.process_id, ancestry = %label, "payload copied to child");

        let mut side = lock(&self.write);
        if side.state == ChannelState::Connected {
            Self::send(&mut side, format_args!("{}{}", TAG_SPAWNED as char, label))?;
        }
        Ok(label)
    }

    fn send(side: &mut WriteSide<T>, args: fmt::Arguments<'_>) -> Result<(), ChannelError> {
        if side.state != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let len = {
            let mut w = FixedWriter::new(&mut side.buf[HEADER_SIZE..]);
            fmt::write(&mut w, args).map_err(|_| ChannelError::MessageTooLong)?;
            w.len()
        };
        side.buf[..HEADER_SIZE].copy_from_slice(&(len as u32).to_le_bytes());
        Self::flush(side, HEADER_SIZE + len)
    }

    fn flush(side: &mut WriteSide<T>, len: usize) -> Result<(), ChannelError> {
        let WriteSide { transport, buf, state } = side;
        let Some(t) = transport.as_mut() else {
            return Err(ChannelError::NotConnected);
        };
        if let Err(e) = t.write_message(&buf[..len]) {
            *transport = None;
            *state = ChannelState::Closed;
            return Err(ChannelError::WriteFailed(e));
        }
        Ok(())
    }
}

/// `fmt::Write` over a fixed slice; overflow is an error, never a reallocation.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FixedWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn len(&self) -> usize {
        self.pos
    }
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}
