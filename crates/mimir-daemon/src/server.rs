//! Daemon server.
//!
//! The daemon listens on a Unix socket. Every accepted connection runs on its
//! own task and walks a small state machine:
//!
//! ```text
//! AwaitHello --HELLO ok--> Established --BYE--> closed
//!     |                        |
//!     +--anything else--> KO, closed
//! ```
//!
//! Established connections keep serving requests until BYE or EOF. A failed
//! command is answered with KO and the connection stays usable. A session
//! outlives a connection only while another connection is attached to it.

use crate::error::{DaemonError, Result};
use crate::handler::CommandHandler;
use crate::protocol::{Command, Data, PROTOCOL_VERSION, Request, Response, fields};
use crate::registry::Runtime;
use crate::session::{SessionTable, session_map};
use mimir_core::properties::keys;
use mimir_core::{Node, Properties, paths};
use mimir_publisher::Publisher;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Connections served concurrently
    pub workers: usize,
}

impl DaemonConfig {
    /// Configuration listening on `socket_path` with one worker per core.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            workers: default_workers(),
        }
    }

    /// Read `mimir.daemon.socketPath` and `mimir.daemon.workers`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a malformed or zero worker count.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let workers = properties.get_parsed(keys::DAEMON_WORKERS, default_workers())?;
        if workers == 0 {
            return Err(DaemonError::config(format!(
                "{} must be at least 1",
                keys::DAEMON_WORKERS
            )));
        }
        Ok(Self {
            socket_path: paths::socket_path(properties)?,
            workers,
        })
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// State shared by all connection tasks
struct Shared {
    handler: CommandHandler,
    sessions: SessionTable,
    shutdown: CancellationToken,
}

/// Connection state
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    AwaitHello,
    Established(String),
}

/// What a connection does after answering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Close,
    Shutdown,
}

/// The mimir daemon.
pub struct Daemon {
    config: DaemonConfig,
    shared: Arc<Shared>,
    publishers: Vec<Arc<dyn Publisher>>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Daemon {
    /// Daemon serving `runtime`.
    #[must_use]
    pub fn new(config: DaemonConfig, runtime: Runtime) -> Self {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                handler: CommandHandler::new(runtime.caching),
                sessions: SessionTable::new(),
                shutdown: CancellationToken::new(),
            }),
            publishers: runtime.publishers,
            workers,
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Socket the daemon listens on.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Token cancelled when the daemon shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Ask the daemon to stop; [`Daemon::serve`] returns once it has.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Bind the Unix socket.
    ///
    /// Creates the socket directory (mode 0700) when missing and removes a
    /// stale socket file. The socket itself gets mode 0600.
    ///
    /// # Errors
    ///
    /// Returns an error when another daemon answers on the socket, or on I/O
    /// failure.
    pub async fn bind(&self) -> Result<UnixListener> {
        let socket = &self.config.socket_path;

        if let Some(parent) = socket.parent()
            && !parent.as_os_str().is_empty()
            && !tokio::fs::try_exists(parent).await.unwrap_or(false)
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DaemonError::io(e, parent, "create socket directory"))?;
            tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| DaemonError::io(e, parent, "restrict socket directory"))?;
        }

        if UnixStream::connect(socket).await.is_ok() {
            return Err(DaemonError::io(
                io::Error::new(io::ErrorKind::AddrInUse, "another daemon is listening"),
                socket,
                "bind socket",
            ));
        }
        match tokio::fs::remove_file(socket).await {
            Ok(()) => tracing::debug!(socket = %socket.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(DaemonError::io(e, socket, "remove stale socket")),
        }

        let listener =
            UnixListener::bind(socket).map_err(|e| DaemonError::io(e, socket, "bind socket"))?;
        tokio::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| DaemonError::io(e, socket, "restrict socket"))?;

        tracing::info!(
            socket = %socket.display(),
            workers = self.config.workers,
            "Daemon listening"
        );
        Ok(listener)
    }

    /// Bind and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns binding errors and errors raised while closing.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shut down, then close.
    ///
    /// # Errors
    ///
    /// Returns errors raised while closing nodes and publishers.
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            tokio::select! {
                () = self.shared.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_connection(stream),
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        drop(listener);
        self.close().await
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let shared = Arc::clone(&self.shared);
        let workers = Arc::clone(&self.workers);
        self.tracker.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            if let Err(e) = handle_connection(stream, &shared).await {
                tracing::debug!(error = %e, "Connection ended with error");
            }
        });
    }

    /// Stop accepting, wait for in-flight connections, close nodes and
    /// publishers and remove the socket file. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns every close error, aggregated.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let mut errors = Vec::new();
        if let Err(e) = self.shared.handler.caching().close().await {
            errors.push(e);
        }
        for publisher in &self.publishers {
            if let Err(e) = publisher.close().await {
                errors.push(e);
            }
        }

        match tokio::fs::remove_file(&self.config.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                socket = %self.config.socket_path.display(),
                error = %e,
                "Failed to remove socket"
            ),
        }

        tracing::info!("Daemon shutdown complete");
        mimir_core::Error::collect(errors)?;
        Ok(())
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("sessions", &self.shared.sessions.len())
            .field("publishers", &self.publishers.len())
            .finish_non_exhaustive()
    }
}

async fn handle_connection(mut stream: UnixStream, shared: &Shared) -> Result<()> {
    let mut state = State::AwaitHello;
    let outcome = serve_requests(&mut stream, shared, &mut state).await;
    if let State::Established(id) = &state {
        shared.sessions.detach(id);
    }
    outcome
}

async fn serve_requests(stream: &mut UnixStream, shared: &Shared, state: &mut State) -> Result<()> {
    loop {
        let request = tokio::select! {
            () = shared.shutdown.cancelled() => return Ok(()),
            read = Request::read_from(&mut *stream) => match read? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        tracing::trace!(command = %request.command, "Request received");
        let (reply, next) = respond(shared, state, &request);
        let response = match reply {
            Reply::Ready(response) => response,
            Reply::Dispatch(command, session) => {
                match shared.handler.dispatch(command, &request.data).await {
                    Ok(data) => Response::ok(data, session),
                    Err(e) => {
                        tracing::debug!(command = %command, error = %e, "Command failed");
                        Response::ko(e.to_string(), session)
                    }
                }
            }
        };

        response.write_to(&mut *stream).await?;
        match next {
            Next::Continue => {}
            Next::Close => return Ok(()),
            Next::Shutdown => {
                shared.shutdown.cancel();
                return Ok(());
            }
        }
    }
}

/// A response, or a command still to run against the caching node
enum Reply {
    Ready(Response),
    Dispatch(Command, Data),
}

fn respond(shared: &Shared, state: &mut State, request: &Request) -> (Reply, Next) {
    let command = match request.command.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            let next = if *state == State::AwaitHello {
                Next::Close
            } else {
                Next::Continue
            };
            return (Reply::Ready(Response::ko(e.to_string(), echo(state, request))), next);
        }
    };

    if *state == State::AwaitHello {
        if command == Command::Hello {
            return hello(shared, state, request);
        }
        // A client that already said HELLO on another connection resumes its session.
        let Some(id) = request
            .session
            .get(fields::SESSION_ID)
            .filter(|id| shared.sessions.attach(id))
        else {
            tracing::debug!(command = %command, "Rejected command before HELLO");
            return (
                Reply::Ready(Response::ko(
                    format!("expected HELLO, got {command}"),
                    request.session.clone(),
                )),
                Next::Close,
            );
        };
        *state = State::Established(id.clone());
    }

    let State::Established(id) = state else {
        return (
            Reply::Ready(Response::ko("no session", request.session.clone())),
            Next::Close,
        );
    };
    let session = session_map(id);

    match command {
        Command::Hello => (
            Reply::Ready(Response::ko("session already established", session)),
            Next::Continue,
        ),
        Command::Bye => {
            shared.sessions.close(id);
            let shutdown = request
                .data
                .get(fields::SHUTDOWN)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            if shutdown {
                tracing::info!(session = %id, "Shutdown requested by client");
            }
            (
                Reply::Ready(Response::ok(Data::new(), session)),
                if shutdown { Next::Shutdown } else { Next::Close },
            )
        }
        other => (Reply::Dispatch(other, session), Next::Continue),
    }
}

fn hello(shared: &Shared, state: &mut State, request: &Request) -> (Reply, Next) {
    let protocol = request.data.get(fields::PROTOCOL).map_or("", String::as_str);
    if protocol != PROTOCOL_VERSION {
        tracing::warn!(protocol, expected = PROTOCOL_VERSION, "Rejected HELLO");
        return (
            Reply::Ready(Response::ko(
                format!("unsupported protocol '{protocol}', expected '{PROTOCOL_VERSION}'"),
                request.session.clone(),
            )),
            Next::Close,
        );
    }

    let session = shared.sessions.open(request.data.clone());
    *state = State::Established(session.id.clone());
    let data = Data::from([
        (fields::PROTOCOL.to_string(), PROTOCOL_VERSION.to_string()),
        (fields::VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ]);
    (Reply::Ready(Response::ok(data, session.wire())), Next::Continue)
}

fn echo(state: &State, request: &Request) -> Data {
    match state {
        State::Established(id) => session_map(id),
        State::AwaitHello => request.session.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::{CachingNode, FileNode, FileNodeConfig};
    use tempfile::TempDir;

    fn shared(tmp: &TempDir) -> Shared {
        let system = FileNode::new(FileNodeConfig::new("file", tmp.path().join("local"))).unwrap();
        Shared {
            handler: CommandHandler::new(Arc::new(CachingNode::new(
                Vec::new(),
                Arc::new(system),
                Vec::new(),
            ))),
            sessions: SessionTable::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn request(command: &str, data: &[(&str, &str)], session: Data) -> Request {
        Request {
            command: command.to_string(),
            data: data
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            session,
        }
    }

    fn ready(reply: Reply) -> Response {
        match reply {
            Reply::Ready(response) => response,
            Reply::Dispatch(command, _) => panic!("unexpected dispatch of {command}"),
        }
    }

    #[test]
    fn test_hello_opens_session() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let mut state = State::AwaitHello;

        let (reply, next) = respond(
            &shared,
            &mut state,
            &request("HELLO", &[("protocol", "1"), ("tool", "maven")], Data::new()),
        );
        let response = ready(reply);
        assert_eq!(next, Next::Continue);
        assert_eq!(response.data[fields::PROTOCOL], PROTOCOL_VERSION);
        let id = response.session[fields::SESSION_ID].clone();
        assert_eq!(state, State::Established(id.clone()));
        assert_eq!(shared.sessions.get(&id).unwrap().client["tool"], "maven");
    }

    #[test]
    fn test_command_before_hello_closes() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let mut state = State::AwaitHello;

        let (reply, next) = respond(
            &shared,
            &mut state,
            &request("LOCATE", &[("key", "mimir:file:b:x")], Data::new()),
        );
        assert_eq!(ready(reply).status, crate::protocol::Status::Ko);
        assert_eq!(next, Next::Close);
        assert!(shared.sessions.is_empty());
    }

    #[test]
    fn test_wrong_protocol_is_rejected_without_session() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let mut state = State::AwaitHello;

        let (reply, next) = respond(
            &shared,
            &mut state,
            &request("HELLO", &[("protocol", "0")], Data::new()),
        );
        assert!(ready(reply).message().unwrap().contains("unsupported protocol"));
        assert_eq!(next, Next::Close);
        assert_eq!(state, State::AwaitHello);
        assert!(shared.sessions.is_empty());
    }

    #[test]
    fn test_known_session_resumes_without_hello() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let session = shared.sessions.open(Data::new());
        let mut state = State::AwaitHello;

        let (reply, next) = respond(
            &shared,
            &mut state,
            &request("LS_CHECKSUMS", &[], session.wire()),
        );
        assert!(matches!(reply, Reply::Dispatch(Command::LsChecksums, _)));
        assert_eq!(next, Next::Continue);
        assert_eq!(state, State::Established(session.id));
    }

    #[test]
    fn test_bye_closes_session_and_may_shut_down() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let session = shared.sessions.open(Data::new());
        let mut state = State::Established(session.id.clone());

        let (_, next) = respond(
            &shared,
            &mut state,
            &request("BYE", &[("shutdown", "true")], session.wire()),
        );
        assert_eq!(next, Next::Shutdown);
        assert!(shared.sessions.get(&session.id).is_none());
    }

    #[test]
    fn test_unknown_command_keeps_established_connection() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(&tmp);
        let session = shared.sessions.open(Data::new());
        let mut state = State::Established(session.id.clone());

        let (reply, next) = respond(&shared, &mut state, &request("FETCH", &[], Data::new()));
        let response = ready(reply);
        assert_eq!(response.session, session.wire());
        assert_eq!(next, Next::Continue);
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        let props = Properties::new()
            .with(keys::DAEMON_SOCKET_PATH, "/tmp/mimir-test.sock")
            .with(keys::DAEMON_WORKERS, "0");
        assert!(DaemonConfig::from_properties(&props).is_err());

        let props = props.with(keys::DAEMON_WORKERS, "3");
        let config = DaemonConfig::from_properties(&props).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.socket_path, Path::new("/tmp/mimir-test.sock"));
    }
}
