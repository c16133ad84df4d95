//! Server errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot create the first trace pipe instance: {0}")]
    FirstInstance(#[source] std::io::Error),

    #[error("no spare trace pipe instance after {attempts} attempts: {last}")]
    SpareUnavailable { attempts: u32, last: std::io::Error },

    #[error("cannot write the dependency file: {0}")]
    Sink(#[source] std::io::Error),

    #[error("trace server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("cannot start the trace server runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("trace server worker thread stopped unexpectedly")]
    WorkerLost,
}
