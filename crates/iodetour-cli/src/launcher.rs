//! Running one tracked process tree.

use crate::error::LaunchError;
use crate::request::LaunchRequest;

#[cfg(windows)]
pub use self::windows::run_process_with_detours;

#[cfg(not(windows))]
pub async fn run_process_with_detours(_request: &LaunchRequest) -> Result<i32, LaunchError> {
    Err(LaunchError::Unsupported)
}

#[cfg(windows)]
mod windows {
    use std::fs::File;
    use std::io::BufWriter;
    use std::mem;
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
    use std::ptr;

    use iodetour_config::{log_launcher_debug, log_launcher_info, log_launcher_warn, ENV_HOOKS_LOG};
    use iodetour_ipc::windows::{inject_library, to_wide, SharedMemoryCopier};
    use iodetour_ipc::{unique_pipe_id, ChildTarget, PayloadCopier};
    use iodetour_server::{create_dependency_file, NamedPipeListener, PipeServer, ServerStats};
    use tokio::sync::oneshot;
    use windows_sys::Win32::Foundation::{GetLastError, HANDLE};
    use windows_sys::Win32::System::SystemInformation::GetTickCount64;
    use windows_sys::Win32::System::Threading::{
        CreateProcessW, GetExitCodeProcess, ResumeThread, TerminateProcess, WaitForSingleObject,
        PROCESS_INFORMATION, STARTUPINFOW,
    };

    use super::{LaunchError, LaunchRequest};
    use crate::console;

    const CREATE_SUSPENDED: u32 = 0x0000_0004;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const INFINITE: u32 = u32::MAX;
    const WAIT_OBJECT_0: u32 = 0;

    fn last_error() -> u32 {
        // SAFETY: reads the calling thread's last-error slot.
        unsafe { GetLastError() }
    }

    fn raw(handle: &OwnedHandle) -> HANDLE {
        handle.as_raw_handle() as HANDLE
    }

    /// The suspended root process.
    struct Child {
        process: OwnedHandle,
        thread: OwnedHandle,
        pid: u32,
    }

    impl Child {
        fn spawn(request: &LaunchRequest, command_line: &str) -> Result<Child, LaunchError> {
            let mut command_line = to_wide(command_line);
            // SAFETY: zeroed STARTUPINFOW/PROCESS_INFORMATION are valid
            // initial states; the command-line buffer is writable and
            // NUL-terminated.
            unsafe {
                let mut startup: STARTUPINFOW = mem::zeroed();
                startup.cb = mem::size_of::<STARTUPINFOW>() as u32;
                let mut info: PROCESS_INFORMATION = mem::zeroed();
                let ok = CreateProcessW(
                    ptr::null(),
                    command_line.as_mut_ptr(),
                    ptr::null(),
                    ptr::null(),
                    1,
                    CREATE_SUSPENDED | CREATE_NEW_PROCESS_GROUP,
                    ptr::null(),
                    ptr::null(),
                    &startup,
                    &mut info,
                );
                if ok == 0 {
                    return Err(LaunchError::CreateProcess {
                        executable: request.executable.clone(),
                        code: last_error(),
                    });
                }
                Ok(Child {
                    process: OwnedHandle::from_raw_handle(info.hProcess as RawHandle),
                    thread: OwnedHandle::from_raw_handle(info.hThread as RawHandle),
                    pid: info.dwProcessId,
                })
            }
        }

        /// Give up on a child that never ran.
        fn kill(&self) {
            // SAFETY: the handle is owned and has terminate access.
            unsafe {
                TerminateProcess(raw(&self.process), 1);
            }
        }
    }

    fn wait_for_exit(process: OwnedHandle) -> Result<i32, LaunchError> {
        // SAFETY: the handle is owned for the duration of both calls.
        unsafe {
            if WaitForSingleObject(raw(&process), INFINITE) != WAIT_OBJECT_0 {
                return Err(LaunchError::Wait(last_error()));
            }
            let mut code = 0u32;
            if GetExitCodeProcess(raw(&process), &mut code) == 0 {
                return Err(LaunchError::Wait(last_error()));
            }
            Ok(code as i32)
        }
    }

    /// Trace server, on the launcher's runtime or on its own thread.
    enum TraceServer {
        Inline(PipeServer<NamedPipeListener, BufWriter<File>>, oneshot::Receiver<()>),
        #[cfg(feature = "worker-thread")]
        Worker(std::thread::JoinHandle<Result<ServerStats, iodetour_server::ServerError>>),
    }

    impl TraceServer {
        fn start(
            listener: NamedPipeListener,
            sink: BufWriter<File>,
            root_exit: oneshot::Receiver<()>,
            worker_thread: bool,
        ) -> Result<TraceServer, LaunchError> {
            #[cfg(feature = "worker-thread")]
            if worker_thread {
                let handle = iodetour_server::spawn_worker(listener, sink, root_exit)?;
                return Ok(TraceServer::Worker(handle));
            }
            #[cfg(not(feature = "worker-thread"))]
            if worker_thread {
                log_launcher_warn!("built without the worker-thread feature, serving inline");
            }
            Ok(TraceServer::Inline(PipeServer::new(listener, sink)?, root_exit))
        }

        async fn finish(self) -> Result<ServerStats, LaunchError> {
            match self {
                TraceServer::Inline(mut server, root_exit) => Ok(server
                    .run(async move {
                        let _ = root_exit.await;
                    })
                    .await?),
                #[cfg(feature = "worker-thread")]
                TraceServer::Worker(handle) => {
                    let joined = tokio::task::spawn_blocking(move || handle.join())
                        .await
                        .map_err(iodetour_server::ServerError::from)?;
                    match joined {
                        Ok(stats) => Ok(stats?),
                        Err(_) => Err(iodetour_server::ServerError::WorkerLost.into()),
                    }
                }
            }
        }
    }

    /// Run `request` under the hooks and return the root process's exit code
    /// once every tracked process has reported.
    pub async fn run_process_with_detours(request: &LaunchRequest) -> Result<i32, LaunchError> {
        if !request.hooks_dll.is_file() {
            return Err(LaunchError::Config(format!(
                "hooks library not found: {}",
                request.hooks_dll.display()
            )));
        }
        if let Some(log) = &request.hooks_log {
            std::env::set_var(ENV_HOOKS_LOG, log);
        }

        let launcher_pid = std::process::id();
        let command_line = request.command_line();
        // SAFETY: no preconditions.
        let ticks = unsafe { GetTickCount64() };
        let pipe_id = unique_pipe_id(ticks, launcher_pid, &command_line);
        let listener = NamedPipeListener::new(&pipe_id, launcher_pid);
        log_launcher_debug!(pipe = listener.name(), command = %command_line, "starting");

        let sink = create_dependency_file(&request.dependency_file).map_err(|source| {
            LaunchError::DependencyFile {
                path: request.dependency_file.clone(),
                source,
            }
        })?;
        let (exit_tx, exit_rx) = oneshot::channel();
        let server = TraceServer::start(listener, sink, exit_rx, request.worker_thread)?;

        let child = Child::spawn(request, &command_line)?;
        if let Err(e) = prepare(request, &child, &pipe_id, launcher_pid) {
            child.kill();
            return Err(e);
        }
        console::forward_ctrl_events(child.pid);

        // SAFETY: the thread handle is owned and suspended.
        if unsafe { ResumeThread(raw(&child.thread)) } == u32::MAX {
            let err = LaunchError::Resume(last_error());
            child.kill();
            return Err(err);
        }
        log_launcher_info!(pid = child.pid, executable = %request.executable, "root process started");

        let Child { process, .. } = child;
        let waiter = tokio::task::spawn_blocking(move || {
            let status = wait_for_exit(process);
            let _ = exit_tx.send(());
            status
        });

        let stats = server.finish().await;
        let status = waiter
            .await
            .map_err(|e| LaunchError::Server(e.into()))?;
        let stats = stats?;
        let code = status?;
        log_launcher_info!(
            exit_code = code,
            records = stats.records,
            clients = stats.clients,
            "root process exited"
        );
        if stats.dropped > 0 {
            log_launcher_warn!(dropped = stats.dropped, "some trace clients sent malformed records");
        }
        if stats.recovered > 0 {
            log_launcher_warn!(
                recovered = stats.recovered,
                "some processes ended without their final dependency list"
            );
        }
        if stats.lost_children > 0 {
            log_launcher_warn!(
                children = stats.lost_children,
                "some child processes never reported"
            );
        }
        Ok(code)
    }

    /// Queue the hooks and hand the root its payload while it is suspended.
    fn prepare(
        request: &LaunchRequest,
        child: &Child,
        pipe_id: &str,
        launcher_pid: u32,
    ) -> Result<(), LaunchError> {
        inject_library(raw(&child.process), raw(&child.thread), &request.hooks_dll)
            .map_err(LaunchError::Inject)?;

        let payload = request.root_payload(pipe_id, launcher_pid)?;
        let block = payload.to_block()?;
        let target = ChildTarget {
            process_handle: raw(&child.process) as usize,
            process_id: child.pid,
        };
        SharedMemoryCopier
            .copy_payload(&target, &block)
            .map_err(LaunchError::Payload)
    }
}
