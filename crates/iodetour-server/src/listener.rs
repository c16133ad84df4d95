//! Pipe instance abstraction.
//!
//! A listener creates instances of one named pipe; each instance serves
//! exactly one client. Operations take `&mut self` and are driven to
//! completion by the server one at a time per instance.

use std::future::Future;
use std::io;

pub trait PipeInstance: Send + 'static {
    /// Wait until a client connects to this instance.
    fn accept(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Read the next message into `buf`. `Ok(0)` means the client sent the
    /// end-of-stream sentinel or disconnected.
    fn read_message(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

pub trait PipeListener {
    type Instance: PipeInstance;

    /// Create a new, not yet connected instance. `first` is set only for the
    /// instance created together with the server; it must fail if the pipe
    /// name is already taken.
    fn create_instance(&mut self, first: bool) -> io::Result<Self::Instance>;
}
