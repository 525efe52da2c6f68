//! JSON-RPC connection over a transport.
//!
//! A writer task drains an unbounded queue so notifications keep their
//! submission order. A reader task routes responses to pending requests and
//! dispatches server requests and notifications to [`Handlers`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Framing, MessageReader, MessageWriter};
use crate::error::{LspError, Result};
use crate::lock;
use crate::protocol::{
    self, Incoming, METHOD_NOT_FOUND, Notification, Request, ResponseError,
};

pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value, ResponseError>> + Send + Sync>;

pub type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

const WRITER_FLUSH_TIMEOUT_SECS: u64 = 2;

type PendingMap = Arc<tokio::sync::Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

/// Handler tables. They outlive individual connections so host
/// registrations survive restarts.
#[derive(Default)]
pub(crate) struct Handlers {
    notifications: Mutex<HashMap<String, NotificationHandler>>,
    requests: Mutex<HashMap<String, RequestHandler>>,
    progress: Mutex<HashMap<String, ProgressHandler>>,
}

impl Handlers {
    pub fn on_notification(&self, method: &str, handler: NotificationHandler) {
        lock(&self.notifications).insert(method.to_string(), handler);
    }

    pub fn on_request(&self, method: &str, handler: RequestHandler) {
        lock(&self.requests).insert(method.to_string(), handler);
    }

    pub fn on_progress(&self, token: &Value, handler: ProgressHandler) {
        lock(&self.progress).insert(protocol::progress_key(token), handler);
    }

    pub fn remove_progress(&self, token: &Value) {
        lock(&self.progress).remove(&protocol::progress_key(token));
    }

    fn notification(&self, method: &str) -> Option<NotificationHandler> {
        lock(&self.notifications).get(method).cloned()
    }

    fn request(&self, method: &str) -> Option<RequestHandler> {
        lock(&self.requests).get(method).cloned()
    }

    fn progress(&self, token: &Value) -> Option<ProgressHandler> {
        lock(&self.progress).get(&protocol::progress_key(token)).cloned()
    }
}

/// Reported to the owner of a connection.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// A read or write failed; `count` is the number of errors so far.
    Error { message: String, count: u32 },
    /// The stream reached EOF or broke.
    Closed,
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) struct Connection {
    name: String,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader_handle: JoinHandle<()>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        name: String,
        reader: BoxedReader,
        writer: BoxedWriter,
        framing: Framing,
        handlers: Arc<Handlers>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let pending: PendingMap = Arc::default();
        let error_count = Arc::new(AtomicU32::new(0));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(write_loop(
            MessageWriter::new(writer, framing),
            writer_rx,
            events.clone(),
            error_count.clone(),
        ));

        let reader_handle = tokio::spawn(read_loop(
            name.clone(),
            MessageReader::new(reader, framing),
            ReaderContext {
                pending: pending.clone(),
                handlers,
                writer_tx: writer_tx.clone(),
                events,
                error_count,
            },
        ));

        Self {
            name,
            writer_tx,
            pending,
            next_id: AtomicI64::new(1),
            reader_handle,
            writer_handle: Mutex::new(Some(writer_handle)),
        }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| LspError::Protocol(e.to_string()))?;
        tracing::trace!(client = %self.name, method, "-> notification");
        self.writer_tx
            .send(WriterCommand::Send(message))
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Send a request and wait for its response.
    ///
    /// An already-cancelled token fails immediately without touching the
    /// wire. Cancelling while in flight sends `$/cancelRequest` and fails
    /// with [`LspError::Cancelled`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value> {
        if token.is_cancelled() {
            return Err(LspError::Cancelled);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| LspError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        tracing::trace!(client = %self.name, method, id, "-> request");
        if self.writer_tx.send(WriterCommand::Send(message)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(LspError::ConnectionClosed);
        }

        tokio::select! {
            response = rx => response.unwrap_or(Err(LspError::ConnectionClosed)),
            () = token.cancelled() => {
                self.pending.lock().await.remove(&id);
                let _ = self.notify("$/cancelRequest", Some(serde_json::json!({ "id": id })));
                Err(LspError::Cancelled)
            }
        }
    }

    /// Fail every outstanding request with `error()`.
    pub async fn fail_pending(&self, error: fn() -> LspError) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
    }

    /// Flush queued writes, close the stream and stop the reader.
    pub async fn close(&self) {
        self.fail_pending(|| LspError::NotRunning).await;
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
        let writer = lock(&self.writer_handle).take();
        if let Some(writer) = writer
            && tokio::time::timeout(Duration::from_secs(WRITER_FLUSH_TIMEOUT_SECS), writer)
                .await
                .is_err()
        {
            tracing::debug!(client = %self.name, "writer did not flush in time");
        }
        self.reader_handle.abort();
    }
}

impl Drop for Connection {
    // The writer drains on its own once every sender is gone.
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// The current connection of a client, swapped on every (re)start.
///
/// Features hold a slot instead of a connection so they keep working
/// across restarts.
#[derive(Clone, Default)]
pub(crate) struct ConnectionSlot(Arc<RwLock<Option<Arc<Connection>>>>);

impl ConnectionSlot {
    pub fn set(&self, connection: Option<Arc<Connection>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = connection;
    }

    pub fn get(&self) -> Option<Arc<Connection>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.get().ok_or(LspError::NotRunning)?.notify(method, params)
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value> {
        let connection = self.get().ok_or(LspError::NotRunning)?;
        connection.request(method, params, token).await
    }
}

async fn write_loop(
    mut writer: MessageWriter<BoxedWriter>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    error_count: Arc<AtomicU32>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(message) => {
                if let Err(e) = writer.write_message(&message).await {
                    tracing::warn!("LSP write error: {e:#}");
                    let count = error_count.fetch_add(1, Ordering::Relaxed) + 1;
                    let _ = events.send(ConnectionEvent::Error {
                        message: format!("{e:#}"),
                        count,
                    });
                    break;
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.close().await;
                break;
            }
        }
    }
}

struct ReaderContext {
    pending: PendingMap,
    handlers: Arc<Handlers>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    error_count: Arc<AtomicU32>,
}

async fn read_loop(name: String, mut reader: MessageReader<BoxedReader>, ctx: ReaderContext) {
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => dispatch(&name, message, &ctx).await,
            Ok(None) => {
                tracing::info!(client = %name, "language server closed its output");
                break;
            }
            Err(e) => {
                tracing::warn!(client = %name, "LSP read error: {e:#}");
                let count = ctx.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = ctx.events.send(ConnectionEvent::Error {
                    message: format!("{e:#}"),
                    count,
                });
                break;
            }
        }
    }

    let drained: Vec<_> = ctx.pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(LspError::ConnectionClosed));
    }
    let _ = ctx.events.send(ConnectionEvent::Closed);
}

async fn dispatch(name: &str, message: Value, ctx: &ReaderContext) {
    let Some(incoming) = protocol::parse_incoming(message) else {
        tracing::debug!(client = %name, "ignoring malformed JSON-RPC message");
        return;
    };

    match incoming {
        Incoming::Response { id, outcome } => {
            let sender = ctx.pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(outcome.map_err(LspError::from_response));
                }
                None => tracing::debug!(client = %name, id, "response for unknown request"),
            }
        }
        Incoming::Request { id, method, params } => {
            let writer_tx = ctx.writer_tx.clone();
            match ctx.handlers.request(&method) {
                Some(handler) => {
                    // Handlers may wait on other responses; never block the reader.
                    tokio::spawn(async move {
                        let outcome = handler(params).await;
                        let _ = writer_tx.send(WriterCommand::Send(protocol::response(id, outcome)));
                    });
                }
                None => {
                    tracing::debug!(client = %name, %method, "no handler for server request");
                    let error = ResponseError::new(
                        METHOD_NOT_FOUND,
                        format!("Unhandled method {method}"),
                    );
                    let _ = writer_tx.send(WriterCommand::Send(protocol::response(id, Err(error))));
                }
            }
        }
        Incoming::Notification { method, params } => {
            if method == "$/progress" && dispatch_progress(params.as_ref(), &ctx.handlers) {
                return;
            }
            match ctx.handlers.notification(&method) {
                Some(handler) => handler(params),
                None => tracing::trace!(client = %name, %method, "ignoring notification"),
            }
        }
    }
}

/// Route `$/progress` to a token handler. Returns false when none matched.
fn dispatch_progress(params: Option<&Value>, handlers: &Handlers) -> bool {
    let Some(params) = params else {
        return false;
    };
    let Some(token) = params.get("token") else {
        return false;
    };
    match handlers.progress(token) {
        Some(handler) => {
            handler(params.get("value").cloned().unwrap_or(Value::Null));
            true
        }
        None => false,
    }
}
