//! The accept/read loop.
//!
//! Every pending operation (an accept or a read) is a task in one
//! [`JoinSet`]. The task owns its pipe instance and read buffer and hands
//! both back with its completion, so all client bookkeeping stays on the
//! thread that drives [`PipeServer::step`].
//!
//! # Spare instance
//!
//! Exactly one instance waits for the next client at any time. When that
//! spare is connected, a replacement is created *before* the new client's
//! data is processed, so a process spawned meanwhile always finds an
//! instance to connect to.
//!
//! # Termination
//!
//! The loop ends when only the spare is left, some client connected (or the
//! root process exited) and no announced child is still on its way. Clients
//! announce children with a spawned notice and introduce themselves with a
//! hello; the two may arrive in either order. A child that was announced but
//! never connects holds the loop open for at most the child grace period.
//!
//! # Streamed records
//!
//! Clients stream observed accesses while they run and send their final list
//! at exit. Streamed lines are written only for a client whose final list
//! never completed, deduplicated by path with the last access winning.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;

use iodetour_config::{log_server_debug, log_server_info, log_server_warn};
use iodetour_ipc::{decode_message, Access, TraceMessage, TraceRecord, MAX_MESSAGE_SIZE};
use tokio::task::{JoinError, JoinSet};

use crate::error::ServerError;
use crate::listener::{PipeInstance, PipeListener};

/// Attempts at creating a replacement spare before giving up.
pub const SPARE_RETRY_LIMIT: u32 = 64;

const SPARE_BACKOFF_MIN: Duration = Duration::from_millis(1);
const SPARE_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// How long an announced child may take to connect once nothing else is
/// keeping the loop alive.
pub const CHILD_CONNECT_GRACE: Duration = Duration::from_secs(30);

/// Identifies one pipe instance for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    AwaitingAccept,
    Reading,
    Closed,
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Records written to the sink.
    pub records: u64,
    /// Clients that connected.
    pub clients: u64,
    /// Clients dropped on a pipe error or a malformed message.
    pub dropped: u64,
    /// Streamed lines written for clients that ended without a final list.
    /// Included in `records`.
    pub recovered: u64,
    /// Announced children that never connected.
    pub lost_children: u64,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Accept,
    Read,
}

struct Completion<I> {
    id: ClientId,
    op: Op,
    instance: I,
    buf: Vec<u8>,
    result: io::Result<usize>,
}

enum Event<I> {
    Completed(Option<Result<Completion<I>, JoinError>>),
    RootExited,
    GraceExpired,
}

struct ObservedLine {
    path: String,
    access: Access,
    superseded: bool,
}

/// What one connected client has told us beyond its final records.
#[derive(Default)]
struct Session {
    observed: Vec<ObservedLine>,
    positions: HashMap<String, usize>,
    final_started: bool,
}

impl Session {
    fn observe(&mut self, record: &TraceRecord<'_>) {
        if self.final_started {
            return;
        }
        match self.positions.get(record.path) {
            Some(&i) => self.observed[i].access = record.access,
            None => {
                self.positions
                    .insert(record.path.to_string(), self.observed.len());
                self.observed.push(ObservedLine {
                    path: record.path.to_string(),
                    access: record.access,
                    superseded: false,
                });
            }
        }
    }

    fn finalized(&mut self, path: &str) {
        if let Some(&i) = self.positions.get(path) {
            self.observed[i].superseded = true;
        }
    }

    /// Streamed lines still owed to the sink.
    fn unreported(&self) -> impl Iterator<Item = &ObservedLine> {
        self.observed.iter().filter(|line| !line.superseded)
    }
}

pub struct PipeServer<L: PipeListener, W> {
    listener: L,
    sink: W,
    ops: JoinSet<Completion<L::Instance>>,
    clients: HashMap<ClientId, ClientState>,
    sessions: HashMap<ClientId, Session>,
    spare: Option<ClientId>,
    next_id: u64,
    connected_any: bool,
    root_exited: bool,
    finished: bool,
    /// Announced children that have not said hello yet.
    pending_children: HashSet<String>,
    /// Hellos whose announcement has not arrived yet.
    early_hellos: HashSet<String>,
    child_grace: Duration,
    stats: ServerStats,
}

impl<L, W> PipeServer<L, W>
where
    L: PipeListener,
    W: Write,
{
    /// Create the first instance and start waiting for the root process.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(mut listener: L, sink: W) -> Result<Self, ServerError> {
        let first = listener
            .create_instance(true)
            .map_err(ServerError::FirstInstance)?;
        let mut server = Self {
            listener,
            sink,
            ops: JoinSet::new(),
            clients: HashMap::new(),
            sessions: HashMap::new(),
            spare: None,
            next_id: 0,
            connected_any: false,
            root_exited: false,
            finished: false,
            pending_children: HashSet::new(),
            early_hellos: HashSet::new(),
            child_grace: CHILD_CONNECT_GRACE,
            stats: ServerStats::default(),
        };
        server.add_spare(first);
        Ok(server)
    }

    /// Override [`CHILD_CONNECT_GRACE`].
    pub fn with_child_grace(mut self, grace: Duration) -> Self {
        self.child_grace = grace;
        self
    }

    /// Instances not yet closed, the spare included.
    pub fn active_count(&self) -> usize {
        self.clients.len()
    }

    pub fn spare(&self) -> Option<ClientId> {
        self.spare
    }

    pub fn client_state(&self, id: ClientId) -> ClientState {
        self.clients
            .get(&id)
            .copied()
            .unwrap_or(ClientState::Closed)
    }

    /// Instances currently waiting for a client.
    pub fn awaiting_accept(&self) -> usize {
        self.clients
            .values()
            .filter(|s| **s == ClientState::AwaitingAccept)
            .count()
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Announced children that have not connected yet.
    pub fn pending_children(&self) -> usize {
        self.pending_children.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The root process is gone. From now on a lone spare ends the loop even
    /// if nothing ever connected.
    pub fn notify_root_exited(&mut self) {
        self.root_exited = true;
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    // ========================================================================
    // Loop
    // ========================================================================

    /// Drive the loop until every client is gone. `root_exit` resolves when
    /// the root process exits.
    pub async fn run<F>(&mut self, root_exit: F) -> Result<ServerStats, ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(root_exit);
        while !self.check_finished().await {
            let watch_root = !self.root_exited;
            let waiting_for_children = self.only_children_pending();
            let event = tokio::select! {
                done = self.ops.join_next() => Event::Completed(done),
                _ = &mut root_exit, if watch_root => Event::RootExited,
                _ = tokio::time::sleep(self.child_grace), if waiting_for_children => {
                    Event::GraceExpired
                }
            };
            match event {
                Event::Completed(done) => self.complete(done).await?,
                Event::RootExited => {
                    log_server_debug!("root process exited");
                    self.notify_root_exited();
                }
                Event::GraceExpired => {
                    log_server_warn!(
                        children = self.pending_children.len(),
                        grace_ms = self.child_grace.as_millis() as u64,
                        "announced child processes never connected"
                    );
                    self.stats.lost_children += self.pending_children.len() as u64;
                    self.pending_children.clear();
                }
            }
        }
        self.sink.flush().map_err(ServerError::Sink)?;
        log_server_info!(
            records = self.stats.records,
            clients = self.stats.clients,
            dropped = self.stats.dropped,
            recovered = self.stats.recovered,
            "trace server finished"
        );
        Ok(self.stats)
    }

    /// Handle exactly one completion. Returns `false` once the loop is over.
    pub async fn step(&mut self) -> Result<bool, ServerError> {
        if self.check_finished().await {
            return Ok(false);
        }
        let done = self.ops.join_next().await;
        self.complete(done).await?;
        Ok(!self.check_finished().await)
    }

    /// Only the spare is left and the tree has started (or its root is gone).
    fn lone_spare(&self) -> bool {
        self.clients.len() == 1
            && self.spare.is_some()
            && (self.connected_any || self.root_exited)
    }

    fn only_children_pending(&self) -> bool {
        self.lone_spare() && !self.pending_children.is_empty()
    }

    async fn check_finished(&mut self) -> bool {
        if self.finished {
            return true;
        }
        if self.lone_spare() && self.pending_children.is_empty() {
            if let Some(id) = self.spare.take() {
                log_server_debug!(client = id.0, "closing unused spare instance");
                self.clients.remove(&id);
            }
            self.ops.shutdown().await;
        }
        if self.clients.is_empty() {
            self.finished = true;
        }
        self.finished
    }

    async fn complete(
        &mut self,
        done: Option<Result<Completion<L::Instance>, JoinError>>,
    ) -> Result<(), ServerError> {
        let completion = match done {
            Some(Ok(completion)) => completion,
            Some(Err(e)) => return Err(ServerError::Task(e)),
            None => {
                // Nothing in flight: every remaining client is unreachable.
                let ids: Vec<ClientId> = self.clients.keys().copied().collect();
                for id in ids {
                    self.end_session(id, false)?;
                }
                self.clients.clear();
                self.spare = None;
                return Ok(());
            }
        };
        let Completion {
            id,
            op,
            instance,
            buf,
            result,
        } = completion;

        match (op, result) {
            (Op::Accept, Ok(_)) => {
                self.clients.insert(id, ClientState::Reading);
                self.sessions.insert(id, Session::default());
                self.connected_any = true;
                self.stats.clients += 1;
                log_server_debug!(client = id.0, "client connected");
                if self.spare == Some(id) {
                    self.spare = None;
                    self.replace_spare().await?;
                }
                self.arm_read(id, instance, buf);
            }
            (Op::Accept, Err(e)) => {
                log_server_warn!(client = id.0, error = %e, "accept failed");
                self.drop_client(id)?;
                if self.spare == Some(id) {
                    self.spare = None;
                    self.replace_spare().await?;
                }
            }
            (Op::Read, Ok(0)) => {
                log_server_debug!(client = id.0, "client finished");
                self.close_client(id, true)?;
            }
            (Op::Read, Ok(n)) => match decode_message(&buf[..n]) {
                Ok(message) => {
                    self.handle_message(id, message)?;
                    self.arm_read(id, instance, buf);
                }
                Err(e) => {
                    log_server_warn!(client = id.0, error = %e, "malformed trace message");
                    self.drop_client(id)?;
                }
            },
            (Op::Read, Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                log_server_debug!(client = id.0, "client disconnected");
                self.close_client(id, false)?;
            }
            (Op::Read, Err(e)) => {
                log_server_warn!(client = id.0, error = %e, "pipe read failed");
                self.drop_client(id)?;
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, id: ClientId, message: TraceMessage<'_>) -> Result<(), ServerError> {
        match message {
            TraceMessage::Record(record) => {
                record
                    .write_line(&mut self.sink)
                    .map_err(ServerError::Sink)?;
                self.stats.records += 1;
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.finalized(record.path);
                }
            }
            TraceMessage::Observed(record) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.observe(&record);
                }
            }
            TraceMessage::FinalRecords => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.final_started = true;
                }
            }
            TraceMessage::Hello(label) => {
                log_server_debug!(client = id.0, ancestry = label, "client introduced itself");
                if !self.pending_children.remove(label) {
                    self.early_hellos.insert(label.to_string());
                }
            }
            TraceMessage::Spawned(label) => {
                log_server_debug!(client = id.0, ancestry = label, "child announced");
                if !self.early_hellos.remove(label) {
                    self.pending_children.insert(label.to_string());
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Clients
    // ========================================================================

    fn add_spare(&mut self, instance: L::Instance) {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(id, ClientState::AwaitingAccept);
        self.spare = Some(id);
        self.ops.spawn(async move {
            let mut instance = instance;
            let result = instance.accept().await.map(|()| 0);
            Completion {
                id,
                op: Op::Accept,
                instance,
                buf: Vec::new(),
                result,
            }
        });
    }

    /// Create the next spare, retrying transient failures with a capped
    /// exponential backoff.
    async fn replace_spare(&mut self) -> Result<(), ServerError> {
        let mut delay = SPARE_BACKOFF_MIN;
        let mut last = None;
        for attempt in 1..=SPARE_RETRY_LIMIT {
            match self.listener.create_instance(false) {
                Ok(instance) => {
                    if attempt > 1 {
                        log_server_debug!(attempt, "spare instance created after retry");
                    }
                    self.add_spare(instance);
                    return Ok(());
                }
                Err(e) => {
                    last = Some(e);
                    if attempt < SPARE_RETRY_LIMIT {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(SPARE_BACKOFF_MAX);
                    }
                }
            }
        }
        Err(ServerError::SpareUnavailable {
            attempts: SPARE_RETRY_LIMIT,
            last: last.unwrap_or_else(|| io::Error::other("no creation attempt")),
        })
    }

    fn arm_read(&mut self, id: ClientId, instance: L::Instance, mut buf: Vec<u8>) {
        if buf.len() != MAX_MESSAGE_SIZE {
            buf = vec![0; MAX_MESSAGE_SIZE];
        }
        self.ops.spawn(async move {
            let mut instance = instance;
            let result = instance.read_message(&mut buf).await;
            Completion {
                id,
                op: Op::Read,
                instance,
                buf,
                result,
            }
        });
    }

    /// `graceful` is true when the client sent the end-of-stream sentinel.
    fn close_client(&mut self, id: ClientId, graceful: bool) -> Result<(), ServerError> {
        self.clients.remove(&id);
        self.end_session(id, graceful)
    }

    fn drop_client(&mut self, id: ClientId) -> Result<(), ServerError> {
        self.stats.dropped += 1;
        self.close_client(id, false)
    }

    /// Write the streamed lines of a client whose final list is missing or
    /// was cut short.
    fn end_session(&mut self, id: ClientId, graceful: bool) -> Result<(), ServerError> {
        let Some(session) = self.sessions.remove(&id) else {
            return Ok(());
        };
        if graceful && session.final_started {
            return Ok(());
        }
        let mut recovered = 0;
        for line in session.unreported() {
            TraceRecord::new(line.access, &line.path)
                .write_line(&mut self.sink)
                .map_err(ServerError::Sink)?;
            recovered += 1;
        }
        if recovered > 0 {
            log_server_debug!(client = id.0, recovered, "wrote streamed records of unfinished client");
        }
        self.stats.records += recovered;
        self.stats.recovered += recovered;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Instances that replay a fixed script. An instance without a script
    /// never gets a client.
    struct Scripted {
        connect: bool,
        messages: VecDeque<io::Result<Vec<u8>>>,
    }

    impl PipeInstance for Scripted {
        async fn accept(&mut self) -> io::Result<()> {
            if !self.connect {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn read_message(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.messages.pop_front() {
                Some(Ok(m)) => {
                    buf[..m.len()].copy_from_slice(&m);
                    Ok(m.len())
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    struct ScriptedListener {
        scripts: Arc<Mutex<VecDeque<Vec<io::Result<Vec<u8>>>>>>,
        refuse_first: bool,
    }

    impl PipeListener for ScriptedListener {
        type Instance = Scripted;

        fn create_instance(&mut self, first: bool) -> io::Result<Scripted> {
            if first && self.refuse_first {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            let script = self.scripts.lock().unwrap().pop_front();
            Ok(Scripted {
                connect: script.is_some(),
                messages: script.unwrap_or_default().into(),
            })
        }
    }

    fn record(access: u8, path: &str) -> Vec<u8> {
        let mut m = ((1 + path.len()) as u32).to_le_bytes().to_vec();
        m.push(access);
        m.extend_from_slice(path.as_bytes());
        m
    }

    #[tokio::test]
    async fn test_first_instance_failure_is_fatal() {
        let listener = ScriptedListener {
            scripts: Arc::default(),
            refuse_first: true,
        };
        let result = PipeServer::new(listener, Vec::new());
        assert!(matches!(result, Err(ServerError::FirstInstance(_))));
    }

    #[tokio::test]
    async fn test_single_client_records_reach_sink() {
        let scripts = VecDeque::from([vec![
            Ok(record(b'1', r"C:\in.txt")),
            Ok(record(b'2', r"C:\out.txt")),
            Ok(Vec::new()),
        ]]);
        let listener = ScriptedListener {
            scripts: Arc::new(Mutex::new(scripts)),
            refuse_first: false,
        };
        let mut server = PipeServer::new(listener, Vec::new()).unwrap();
        let stats = server.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.records, 2);
        assert_eq!(stats.clients, 1);
        assert_eq!(
            String::from_utf8(server.into_sink()).unwrap(),
            "1C:\\in.txt\n2C:\\out.txt\n"
        );
    }

    #[tokio::test]
    async fn test_malformed_message_drops_client() {
        let scripts = VecDeque::from([vec![Ok(vec![1, 0, 0]), Ok(record(b'1', "never"))]]);
        let listener = ScriptedListener {
            scripts: Arc::new(Mutex::new(scripts)),
            refuse_first: false,
        };
        let mut server = PipeServer::new(listener, Vec::new()).unwrap();
        let stats = server.run(std::future::pending()).await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.records, 0);
        assert!(server.sink().is_empty());
    }

    #[tokio::test]
    async fn test_read_error_drops_client() {
        let scripts = VecDeque::from([vec![
            Ok(record(b'4', r"C:\tool.exe")),
            Err(io::Error::other("pipe reset")),
        ]]);
        let listener = ScriptedListener {
            scripts: Arc::new(Mutex::new(scripts)),
            refuse_first: false,
        };
        let mut server = PipeServer::new(listener, Vec::new()).unwrap();
        let stats = server.run(std::future::pending()).await.unwrap();
        assert_eq!(
            stats,
            ServerStats {
                records: 1,
                clients: 1,
                dropped: 1,
                ..ServerStats::default()
            }
        );
    }

    fn control(tag: u8, text: &str) -> Vec<u8> {
        record(tag, text)
    }

    fn observed(access: u8, path: &str) -> Vec<u8> {
        let mut m = ((2 + path.len()) as u32).to_le_bytes().to_vec();
        m.extend_from_slice(&[b'O', access]);
        m.extend_from_slice(path.as_bytes());
        m
    }

    fn server_for(scripts: Vec<Vec<io::Result<Vec<u8>>>>) -> PipeServer<ScriptedListener, Vec<u8>> {
        let listener = ScriptedListener {
            scripts: Arc::new(Mutex::new(scripts.into())),
            refuse_first: false,
        };
        PipeServer::new(listener, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_streamed_lines_survive_a_killed_client() {
        let mut server = server_for(vec![vec![
            Ok(control(b'H', "1.")),
            Ok(observed(b'1', r"C:\src\a.c")),
            Ok(observed(b'2', r"C:\obj\a.obj")),
            Ok(observed(b'3', r"C:\src\a.c")),
            Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        ]]);
        let stats = server.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.recovered, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.dropped, 0);
        assert_eq!(
            String::from_utf8(server.into_sink()).unwrap(),
            "3C:\\src\\a.c\n2C:\\obj\\a.obj\n"
        );
    }

    #[tokio::test]
    async fn test_final_list_replaces_streamed_lines() {
        let mut server = server_for(vec![vec![
            Ok(observed(b'1', r"C:\src\a.c")),
            Ok(observed(b'1', r"C:\tmp\scratch")),
            Ok(control(b'F', "")),
            Ok(record(b'1', r"C:\src\a.c")),
            Ok(Vec::new()),
        ]]);
        let stats = server.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.recovered, 0);
        assert_eq!(String::from_utf8(server.into_sink()).unwrap(), "1C:\\src\\a.c\n");
    }

    #[tokio::test]
    async fn test_cut_short_final_list_keeps_missing_streamed_lines() {
        let mut server = server_for(vec![vec![
            Ok(observed(b'1', r"C:\src\a.c")),
            Ok(observed(b'2', r"C:\obj\a.obj")),
            Ok(control(b'F', "")),
            Ok(record(b'1', r"C:\src\a.c")),
            Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        ]]);
        let stats = server.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.recovered, 1);
        assert_eq!(
            String::from_utf8(server.into_sink()).unwrap(),
            "1C:\\src\\a.c\n2C:\\obj\\a.obj\n"
        );
    }

    #[tokio::test]
    async fn test_announced_child_that_never_connects_ends_after_grace() {
        let mut server = server_for(vec![vec![
            Ok(control(b'H', "1.")),
            Ok(control(b'S', "1.2.")),
            Ok(record(b'1', r"C:\in.txt")),
            Ok(Vec::new()),
        ]])
        .with_child_grace(Duration::from_millis(20));
        let stats = server.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.records, 1);
        assert_eq!(stats.lost_children, 1);
        assert_eq!(server.pending_children(), 0);
        assert!(server.is_finished());
    }

    #[tokio::test]
    async fn test_hello_and_announcement_match_in_either_order() {
        let mut server = server_for(Vec::new());
        let id = ClientId(7);

        server.handle_message(id, TraceMessage::Hello("1.2.")).unwrap();
        assert_eq!(server.pending_children(), 0);
        server.handle_message(id, TraceMessage::Spawned("1.2.")).unwrap();
        assert_eq!(server.pending_children(), 0);

        server.handle_message(id, TraceMessage::Spawned("1.3.")).unwrap();
        assert_eq!(server.pending_children(), 1);
        server.handle_message(id, TraceMessage::Hello("1.3.")).unwrap();
        assert_eq!(server.pending_children(), 0);
    }
}
