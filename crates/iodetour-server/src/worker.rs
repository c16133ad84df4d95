//! Dedicated-thread mode.

use std::io::Write;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;

use crate::error::ServerError;
use crate::listener::PipeListener;
use crate::server::{PipeServer, ServerStats};

/// Run the server on its own thread with a private current-thread runtime.
///
/// Returns once the first instance exists, so the caller may spawn the root
/// process right away. Send on (or drop) the sender paired with `root_exit`
/// when the root process exits.
pub fn spawn_worker<L, W>(
    listener: L,
    sink: W,
    root_exit: oneshot::Receiver<()>,
) -> Result<JoinHandle<Result<ServerStats, ServerError>>, ServerError>
where
    L: PipeListener + Send + 'static,
    W: Write + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("iodetour-server".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(ServerError::Runtime)?;
            rt.block_on(async move {
                let mut server = match PipeServer::new(listener, sink) {
                    Ok(server) => {
                        let _ = ready_tx.send(None);
                        server
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Some(e));
                        return Ok(ServerStats::default());
                    }
                };
                server
                    .run(async move {
                        let _ = root_exit.await;
                    })
                    .await
            })
        })
        .map_err(ServerError::Runtime)?;

    match ready_rx.recv() {
        Ok(None) => Ok(handle),
        Ok(Some(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => match handle.join() {
            Ok(Err(e)) => Err(e),
            _ => Err(ServerError::WorkerLost),
        },
    }
}
