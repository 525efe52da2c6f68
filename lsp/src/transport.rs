//! Transports: how a client reaches its language server.
//!
//! Every transport yields a reader/writer pair plus, when the client
//! spawned the server, the child process handle.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use crate::codec::Framing;
use crate::connection::{BoxedReader, BoxedWriter};
use crate::error::{LspError, Result};

/// Attempts made when dialing a pipe or socket the server creates itself.
pub const CONNECT_ATTEMPTS: u32 = 8;

/// First retry delay; doubles after every failed attempt.
pub const CONNECT_BASE_DELAY_MS: u64 = 50;

const SOCKET_ACCEPT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_NODE_RUNTIME: &str = "node";

#[cfg(unix)]
const IPC_CHANNEL_FD: i32 = 3;

/// How a spawned server talks to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    /// Node-style IPC channel on an inherited socket, newline-delimited JSON.
    Ipc,
    /// Unix socket or named pipe created by the server.
    Pipe,
    /// The client listens on `port` (0 picks a free one) and the server dials in.
    Socket { port: u16 },
}

/// A command-line language server.
#[derive(Debug, Clone, Default)]
pub struct Executable {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// `None` runs over stdio without adding any transport flag.
    pub transport: Option<TransportKind>,
}

/// A server shipped as a script run by a runtime such as `node`.
#[derive(Debug, Clone)]
pub struct NodeModule {
    pub module: PathBuf,
    pub runtime: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub transport: TransportKind,
}

/// Produces a fresh transport for every start, e.g. an in-process server.
pub trait TransportFactory: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>>;
}

#[derive(Clone)]
pub enum ServerOptions {
    Executable(Executable),
    Module(NodeModule),
    /// Dial a server that is already listening.
    Tcp {
        host: String,
        port: u16,
    },
    Factory(Arc<dyn TransportFactory>),
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executable(exe) => f.debug_tuple("Executable").field(exe).finish(),
            Self::Module(module) => f.debug_tuple("Module").field(module).finish(),
            Self::Tcp { host, port } => f
                .debug_struct("Tcp")
                .field("host", host)
                .field("port", port)
                .finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// An open duplex stream to a server.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    framing: Framing,
    child: Option<Child>,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, framing: Framing) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            framing,
            child: None,
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    #[must_use]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub(crate) fn into_parts(self) -> (BoxedReader, BoxedWriter, Framing, Option<Child>) {
        (self.reader, self.writer, self.framing, self.child)
    }
}

/// Open the transport described by `options`.
pub async fn open(options: &ServerOptions) -> Result<Transport> {
    match options {
        ServerOptions::Executable(exe) => {
            let program = resolve_command(&exe.command)?;
            let launch = Launch {
                label: exe.command.clone(),
                program,
                args: exe.args.clone(),
                cwd: exe.cwd.clone(),
                env: exe.env.clone(),
            };
            launch.run(exe.transport).await
        }
        ServerOptions::Module(module) => {
            let runtime = module.runtime.as_deref().unwrap_or(DEFAULT_NODE_RUNTIME);
            let program = resolve_command(runtime)?;
            let mut args = vec![module.module.to_string_lossy().into_owned()];
            args.extend(module.args.iter().cloned());
            let launch = Launch {
                label: module.module.display().to_string(),
                program,
                args,
                cwd: module.cwd.clone(),
                env: module.env.clone(),
            };
            launch.run(Some(module.transport)).await
        }
        ServerOptions::Tcp { host, port } => {
            let address = format!("{host}:{port}");
            let stream =
                connect_with_backoff(&address, || TcpStream::connect(address.clone())).await?;
            let (reader, writer) = stream.into_split();
            Ok(Transport::new(reader, writer, Framing::ContentLength))
        }
        ServerOptions::Factory(factory) => factory.connect().await,
    }
}

fn resolve_command(command: &str) -> Result<PathBuf> {
    which::which(command).map_err(|_| LspError::CommandNotFound(command.to_string()))
}

struct Launch {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl Launch {
    async fn run(self, transport: Option<TransportKind>) -> Result<Transport> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        if transport.is_some() {
            command.arg(format!("--clientProcessId={}", std::process::id()));
        }

        match transport {
            None => self.spawn_stdio(command),
            Some(TransportKind::Stdio) => {
                command.arg("--stdio");
                self.spawn_stdio(command)
            }
            Some(TransportKind::Ipc) => self.spawn_ipc(command),
            Some(TransportKind::Pipe) => self.spawn_pipe(command).await,
            Some(TransportKind::Socket { port }) => self.spawn_socket(command, port).await,
        }
    }

    fn spawn(&self, command: &mut Command) -> Result<Child> {
        tracing::debug!(server = %self.label, program = %self.program.display(), "spawning language server");
        let mut child = command.spawn().map_err(|source| LspError::Spawn {
            command: self.label.clone(),
            source,
        })?;
        forward_stderr(&mut child, &self.label);
        Ok(child)
    }

    fn spawn_stdio(&self, mut command: Command) -> Result<Transport> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = self.spawn(&mut command)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Transport("no stdout from child".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Transport("no stdin from child".into()))?;
        Ok(Transport::new(stdout, stdin, Framing::ContentLength).with_child(child))
    }

    #[cfg(unix)]
    fn spawn_ipc(&self, mut command: Command) -> Result<Transport> {
        use std::os::fd::AsRawFd;

        let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
        let child_fd = child_end.as_raw_fd();
        command
            .arg("--node-ipc")
            .env("NODE_CHANNEL_FD", IPC_CHANNEL_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        // SAFETY: the closure runs in the forked child before exec and only
        // calls async-signal-safe libc functions.
        unsafe {
            command.pre_exec(move || {
                if child_fd == IPC_CHANNEL_FD {
                    if libc::fcntl(child_fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, IPC_CHANNEL_FD) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = self.spawn(&mut command)?;
        drop(child_end);

        parent_end.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(parent_end)?;
        let (reader, writer) = stream.into_split();
        Ok(Transport::new(reader, writer, Framing::NewlineDelimited).with_child(child))
    }

    #[cfg(not(unix))]
    fn spawn_ipc(&self, _command: Command) -> Result<Transport> {
        Err(LspError::Unsupported(
            "the ipc transport requires a unix platform".into(),
        ))
    }

    #[cfg(unix)]
    async fn spawn_pipe(&self, mut command: Command) -> Result<Transport> {
        let path = std::env::temp_dir().join(format!("tether-{}.sock", uuid::Uuid::new_v4().simple()));
        command
            .arg(format!("--pipe={}", path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let child = self.spawn(&mut command)?;

        let stream = connect_pipe(&path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Transport::new(reader, writer, Framing::ContentLength).with_child(child))
    }

    #[cfg(windows)]
    async fn spawn_pipe(&self, mut command: Command) -> Result<Transport> {
        use tokio::net::windows::named_pipe::ClientOptions;

        let name = format!(r"\\.\pipe\tether-{}", uuid::Uuid::new_v4().simple());
        command
            .arg(format!("--pipe={name}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let child = self.spawn(&mut command)?;

        let client = connect_with_backoff(&name, || {
            let name = name.clone();
            async move { ClientOptions::new().open(&name) }
        })
        .await?;
        let (reader, writer) = tokio::io::split(client);
        Ok(Transport::new(reader, writer, Framing::ContentLength).with_child(child))
    }

    async fn spawn_socket(&self, mut command: Command, port: u16) -> Result<Transport> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let port = listener.local_addr()?.port();
        command
            .arg(format!("--socket={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        let child = self.spawn(&mut command)?;

        let accepted = tokio::time::timeout(
            Duration::from_secs(SOCKET_ACCEPT_TIMEOUT_SECS),
            listener.accept(),
        )
        .await
        .map_err(|_| LspError::Timeout("waiting for the server to connect"))?;
        let (stream, peer) = accepted?;
        tracing::debug!(server = %self.label, %peer, "language server connected");

        let (reader, writer) = stream.into_split();
        Ok(Transport::new(reader, writer, Framing::ContentLength).with_child(child))
    }
}

/// Mirror the server's stderr into the log.
fn forward_stderr(child: &mut Child, label: &str) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    let label = label.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %label, "stderr: {line}");
        }
    });
}

/// Connect to the server's unix socket, then unlink it. The open stream
/// outlives the path, and nothing else dials it.
#[cfg(unix)]
async fn connect_pipe(path: &std::path::Path) -> Result<tokio::net::UnixStream> {
    let what = path.display().to_string();
    let connected =
        connect_with_backoff(&what, || tokio::net::UnixStream::connect(path.to_path_buf())).await;
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!("removing {what} failed: {e}");
    }
    connected
}

/// Retry `connect` with exponential backoff, [`CONNECT_ATTEMPTS`] times.
async fn connect_with_backoff<T, F, Fut>(what: &str, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let mut delay = Duration::from_millis(CONNECT_BASE_DELAY_MS);
    let mut last_error = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match connect().await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(attempt, "connecting to {what} failed: {e}");
                last_error = Some(e);
            }
        }
        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(LspError::Transport(format!(
        "could not connect to {what} after {CONNECT_ATTEMPTS} attempts: {reason}"
    )))
}
