//! Named-pipe listener on tokio's Windows pipe support.

use std::io;

use iodetour_ipc::{pipe_name, HEADER_SIZE, MAX_MESSAGE_SIZE};
use tokio::io::AsyncReadExt;
use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};

use crate::listener::{PipeInstance, PipeListener};

/// Creates inbound, message-mode instances of one trace pipe.
#[derive(Debug, Clone)]
pub struct NamedPipeListener {
    name: String,
}

impl NamedPipeListener {
    pub fn new(named_pipe_id: &str, trace_process_id: u32) -> Self {
        Self {
            name: pipe_name(named_pipe_id, trace_process_id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PipeListener for NamedPipeListener {
    type Instance = NamedPipeInstance;

    fn create_instance(&mut self, first: bool) -> io::Result<NamedPipeInstance> {
        let server = ServerOptions::new()
            .first_pipe_instance(first)
            .pipe_mode(PipeMode::Message)
            .access_inbound(true)
            .access_outbound(false)
            .in_buffer_size(MAX_MESSAGE_SIZE as u32)
            .create(&self.name)?;
        Ok(NamedPipeInstance { server })
    }
}

pub struct NamedPipeInstance {
    server: NamedPipeServer,
}

impl PipeInstance for NamedPipeInstance {
    async fn accept(&mut self) -> io::Result<()> {
        self.server.connect().await
    }

    /// Records carry their own length, so framing does not depend on the
    /// pipe preserving message boundaries. The empty close sentinel reads as
    /// end of stream.
    async fn read_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut header = [0u8; HEADER_SIZE];
        match self.server.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(e),
        }
        let body = u32::from_le_bytes(header) as usize;
        let total = HEADER_SIZE + body;
        if body == 0 || total > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("trace record of {total} bytes"),
            ));
        }
        buf[..HEADER_SIZE].copy_from_slice(&header);
        self.server.read_exact(&mut buf[HEADER_SIZE..total]).await?;
        Ok(total)
    }
}
