//! # iodetour-server
//!
//! Launcher side of the trace pipe.
//!
//! One [`PipeServer`] accepts a connection from every detoured process in
//! the tree, decodes their trace records and appends them to the dependency
//! file. Instances are created through a [`PipeListener`]; the Windows
//! implementation is [`NamedPipeListener`].
//!
//! With the `worker-thread` feature the loop can be moved to a dedicated
//! thread through [`spawn_worker`]; by default it runs on the caller's
//! runtime.

pub mod error;
pub mod listener;
pub mod server;
pub mod sink;
#[cfg(windows)]
pub mod windows;
#[cfg(feature = "worker-thread")]
pub mod worker;

pub use error::ServerError;
pub use listener::{PipeInstance, PipeListener};
pub use server::{
    ClientId, ClientState, PipeServer, ServerStats, CHILD_CONNECT_GRACE, SPARE_RETRY_LIMIT,
};
pub use sink::create_dependency_file;
#[cfg(windows)]
pub use windows::{NamedPipeInstance, NamedPipeListener};
#[cfg(feature = "worker-thread")]
pub use worker::spawn_worker;
