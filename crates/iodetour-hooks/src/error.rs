//! Failures while setting up the hooks.
//!
//! None of these reach the host process: setup failures are logged and the
//! process either runs untracked or is terminated with one of the channel
//! exit codes.

use iodetour_ipc::{ChannelError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("no payload for this process: {0}")]
    Payload(#[from] TransportError),
    #[error("trace channel: {0}")]
    Channel(#[from] ChannelError),
    #[error("detour {function}: {message}")]
    Detour {
        function: &'static str,
        message: String,
    },
    #[error("module path of the hooks library is unavailable")]
    ModulePath,
}
