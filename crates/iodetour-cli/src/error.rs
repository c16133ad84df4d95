//! Launcher failures and their exit codes.
//!
//! A child's own exit code is passed through untouched; these codes are
//! negative so a launcher failure is never mistaken for one.

use std::path::PathBuf;

use iodetour_ipc::{PayloadError, TransportError};
use iodetour_server::ServerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot create dependency file {}: {source}", path.display())]
    DependencyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trace server failed: {0}")]
    Server(#[from] ServerError),

    #[error("cannot start {executable}: Win32 error {code}")]
    CreateProcess { executable: String, code: u32 },

    #[error("cannot load the hooks library into the child: {0}")]
    Inject(#[source] TransportError),

    #[error("cannot hand the payload to the child: {0}")]
    Payload(#[source] TransportError),

    #[error("cannot resume the child: Win32 error {0}")]
    Resume(u32),

    #[error("cannot collect the child's exit status: Win32 error {0}")]
    Wait(u32),

    #[error("dependency tracking needs Windows")]
    Unsupported,
}

impl From<PayloadError> for LaunchError {
    fn from(e: PayloadError) -> Self {
        LaunchError::Payload(TransportError::Payload(e))
    }
}

impl LaunchError {
    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Config(_) => -1,
            LaunchError::DependencyFile { .. } => -2,
            LaunchError::Server(_) => -3,
            LaunchError::CreateProcess { .. } => -4,
            LaunchError::Inject(_) => -5,
            LaunchError::Payload(_) => -6,
            LaunchError::Resume(_) => -7,
            LaunchError::Wait(_) => -8,
            LaunchError::Unsupported => -9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> Vec<LaunchError> {
        vec![
            LaunchError::Config("x".into()),
            LaunchError::DependencyFile {
                path: PathBuf::from("out.d"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
            LaunchError::Server(ServerError::WorkerLost),
            LaunchError::CreateProcess {
                executable: "cl.exe".into(),
                code: 2,
            },
            LaunchError::Inject(TransportError::Win32 {
                op: "VirtualAllocEx",
                code: 5,
            }),
            PayloadError::AncestryFull(64).into(),
            LaunchError::Resume(6),
            LaunchError::Wait(6),
            LaunchError::Unsupported,
        ]
    }

    #[test]
    fn test_exit_codes_are_distinct_and_negative() {
        let codes: Vec<i32> = all().iter().map(LaunchError::exit_code).collect();
        assert_eq!(codes, (1..=9).map(|n| -n).collect::<Vec<_>>());
    }

    #[test]
    fn test_payload_error_maps_to_payload_code() {
        let err: LaunchError = PayloadError::BadGuid.into();
        assert_eq!(err.exit_code(), -6);
        assert!(err.to_string().contains("payload"));
    }
}
