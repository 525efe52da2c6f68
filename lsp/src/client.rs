//! The language client: lifecycle, supervision and the host-facing API.
//!
//! A [`LanguageClient`] owns one server at a time. `start` opens the
//! transport, performs the `initialize` handshake and lets every feature read
//! the server capabilities. A supervisor task per connection feeds transport
//! errors and unexpected closes into the [`ErrorHandler`], which decides
//! between restarting and giving up.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::connection::{Connection, ConnectionEvent, ConnectionSlot, Handlers};
use crate::diagnostics::{DiagnosticCollection, DiagnosticPublisher};
use crate::error::{LspError, Result};
use crate::features::configuration::{
    DidChangeConfigurationFeature, WorkspaceConfigurationFeature, configuration_response,
};
use crate::features::diagnostic::{DiagnosticConfig, DiagnosticFeature};
use crate::features::general::{PublishDiagnosticsFeature, WindowFeature, WorkspaceFoldersFeature};
use crate::features::sync::{SyncConfig, SyncFeatures};
use crate::features::{DynamicFeature, Feature, FeatureRegistry};
use crate::lock;
use crate::policy::{
    CloseAction, DefaultErrorHandler, ErrorAction, ErrorHandler, InitializationFailedHandler,
    retry_initialization,
};
use crate::protocol::{
    self, ConfigurationParams, INVALID_PARAMS, InitializeResult, MessageParams, ProgressParams,
    PublishDiagnosticsParams, RegistrationParams, ResponseError, ServerInfo, UnregistrationParams,
};
use crate::transport;
use crate::types::{
    ClientEvent, ClientState, MessageType, TextDocument, TextDocumentChangeEvent, TextEdit,
    WillSaveEvent,
};
use crate::workspace::{MemoryWorkspace, Workspace};

const INIT_TIMEOUT_SECS: u64 = 30;

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The process and connection of one server run.
struct Session {
    connection: Arc<Connection>,
    child: Option<Child>,
}

#[derive(Debug, Default)]
struct ServerData {
    capabilities: Option<Value>,
    info: Option<ServerInfo>,
}

struct ClientShared {
    name: String,
    options: ClientOptions,
    workspace: Arc<dyn Workspace>,
    /// Set when the host gave no workspace; the client mirrors documents
    /// into it from the `did_*` calls.
    own_workspace: Option<Arc<MemoryWorkspace>>,
    connection: ConnectionSlot,
    handlers: Arc<Handlers>,
    registry: FeatureRegistry,
    sync: SyncFeatures,
    diagnostic: Arc<DiagnosticFeature>,
    configuration: Arc<DidChangeConfigurationFeature>,
    collection: DiagnosticCollection,
    publisher: DiagnosticPublisher,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<ClientState>,
    error_handler: Arc<dyn ErrorHandler>,
    initialization_failed: InitializationFailedHandler,
    /// Serializes start, stop and restart decisions.
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    /// Bumped whenever a session ends so stale supervisors stand down.
    generation: AtomicU64,
    server: Mutex<ServerData>,
    push: Mutex<Option<mpsc::UnboundedSender<PublishDiagnosticsParams>>>,
}

/// A language client bound to one server configuration.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct LanguageClient {
    shared: Arc<ClientShared>,
}

impl LanguageClient {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let name = options.name.clone();
        let (own_workspace, workspace): (Option<Arc<MemoryWorkspace>>, Arc<dyn Workspace>) =
            match &options.workspace {
                Some(workspace) => (None, workspace.clone()),
                None => {
                    let own = Arc::new(MemoryWorkspace::new(std::env::current_dir().ok()));
                    (Some(own.clone()), own)
                }
            };

        let connection = ConnectionSlot::default();
        let handlers = Arc::new(Handlers::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let collection = DiagnosticCollection::new();
        let publisher = DiagnosticPublisher::new(
            collection.clone(),
            events.clone(),
            options.middleware.clone(),
        );

        let sync = SyncFeatures::new(SyncConfig {
            connection: connection.clone(),
            middleware: options.middleware.clone(),
            workspace: workspace.clone(),
            client_selector: options.document_selector.clone(),
            ignored: options.ignored_documents.clone(),
            delay_open: options.delay_open_notifications,
            will_save_wait_until_timeout: options.will_save_wait_until_timeout,
        });
        let diagnostic = DiagnosticFeature::new(DiagnosticConfig {
            sync: sync.shared.clone(),
            handlers: handlers.clone(),
            publisher: publisher.clone(),
            options: options.diagnostic_pull.clone(),
            client_selector: options.document_selector.clone(),
        });
        let configuration = Arc::new(DidChangeConfigurationFeature::new(
            connection.clone(),
            workspace.clone(),
            options.configuration_section.clone(),
        ));

        let registry = FeatureRegistry::new(options.disabled_features.clone());
        registry.register_feature(Feature::Static(Arc::new(WindowFeature)));
        registry.register_feature(Feature::Static(Arc::new(PublishDiagnosticsFeature)));
        registry.register_feature(Feature::Static(Arc::new(WorkspaceFoldersFeature)));
        registry.register_feature(Feature::Static(Arc::new(WorkspaceConfigurationFeature)));
        for feature in sync.all() {
            registry.register_feature(Feature::Dynamic(feature));
        }
        registry.register_feature(Feature::Dynamic(configuration.clone()));
        registry.register_feature(Feature::Dynamic(diagnostic.clone()));

        let error_handler = options.error_handler.clone().unwrap_or_else(|| {
            Arc::new(DefaultErrorHandler::new(
                name.clone(),
                options.max_restart_count,
                options.restart_window,
            ))
        });
        let initialization_failed = options
            .initialization_failed_handler
            .clone()
            .unwrap_or_else(|| retry_initialization(options.initialization_retries));
        let (state, _) = watch::channel(ClientState::Initial);

        let shared = Arc::new(ClientShared {
            name,
            options,
            workspace,
            own_workspace,
            connection,
            handlers,
            registry,
            sync,
            diagnostic,
            configuration,
            collection,
            publisher,
            events,
            state,
            error_handler,
            initialization_failed,
            lifecycle: tokio::sync::Mutex::new(()),
            session: Mutex::default(),
            generation: AtomicU64::new(0),
            server: Mutex::default(),
            push: Mutex::default(),
        });
        install_builtin_handlers(&shared);
        Self { shared }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    /// Every state transition, diagnostics update and server message.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// The current state, updated on every transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn workspace(&self) -> Arc<dyn Workspace> {
        self.shared.workspace.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the server. Succeeds immediately when already running.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        match self.state() {
            ClientState::Running | ClientState::Starting => Ok(()),
            _ => self.shared.start_locked().await,
        }
    }

    /// Shut the server down. Safe to call repeatedly and concurrently.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        self.shared.stop_locked().await
    }

    pub async fn restart(&self) -> Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        if let Err(e) = self.shared.stop_locked().await {
            tracing::warn!(client = %self.shared.name, "stop before restart failed: {e}");
        }
        self.shared.start_locked().await
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Handle a server notification. Replaces any earlier handler for
    /// `method` and survives restarts.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.shared.handlers.on_notification(method, Arc::new(handler));
    }

    /// Answer a server request.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ResponseError>> + Send + 'static,
    {
        self.shared.handlers.on_request(
            method,
            Arc::new(move |params: Option<Value>| handler(params).boxed()),
        );
    }

    /// Receive `$/progress` values for `token`.
    pub fn on_progress<F>(&self, token: &Value, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.shared.handlers.on_progress(token, Arc::new(handler));
    }

    /// Send a request. Waits while the client is starting; fails with
    /// [`LspError::NotRunning`] otherwise.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value> {
        self.shared.wait_running(&token).await?;
        self.shared.connection.request(method, params, token).await
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.shared.wait_running(&CancellationToken::new()).await?;
        self.shared.connection.notify(method, params)
    }

    // ── Features and server data ────────────────────────────────────────

    /// The dynamic feature handling `method`, e.g. `textDocument/didOpen`.
    #[must_use]
    pub fn get_feature(&self, method: &str) -> Option<Arc<dyn DynamicFeature>> {
        self.shared.registry.get(method)
    }

    #[must_use]
    pub fn pull_diagnostics(&self) -> Arc<DiagnosticFeature> {
        self.shared.diagnostic.clone()
    }

    /// Diagnostics from both push and pull, keyed by URI.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticCollection {
        self.shared.collection.clone()
    }

    #[must_use]
    pub fn server_capabilities(&self) -> Option<Value> {
        lock(&self.shared.server).capabilities.clone()
    }

    #[must_use]
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.shared.server).info.clone()
    }

    // ── Documents ───────────────────────────────────────────────────────

    pub async fn did_open(&self, document: TextDocument) {
        if let Some(own) = &self.shared.own_workspace {
            own.open(document.clone());
        }
        self.shared.sync.did_open.did_open(document).await;
    }

    pub async fn did_change(&self, event: TextDocumentChangeEvent) {
        if let Some(own) = &self.shared.own_workspace {
            own.update(event.document.clone());
        }
        self.shared.sync.did_change.did_change(event).await;
    }

    pub async fn will_save(&self, event: WillSaveEvent) {
        self.shared.sync.will_save.will_save(event).await;
    }

    /// Edits the server wants applied before the save; empty when it does
    /// not answer in time.
    pub async fn will_save_wait_until(&self, event: WillSaveEvent) -> Vec<TextEdit> {
        self.shared
            .sync
            .will_save_wait_until
            .will_save_wait_until(event)
            .await
    }

    pub async fn did_save(&self, document: TextDocument) {
        self.shared.sync.did_save.did_save(document).await;
    }

    pub async fn did_close(&self, document: TextDocument) {
        if let Some(own) = &self.shared.own_workspace {
            own.close(document.uri());
        }
        self.shared.sync.did_close.did_close(document).await;
    }

    /// The host's visible documents changed. Sends delayed opens and pulls
    /// diagnostics for newly visible documents.
    pub async fn did_change_visible(&self, uris: &[String]) {
        self.shared.sync.shared.open_visible(uris).await;
        self.shared.diagnostic.visibility_changed();
    }

    /// The host focused `uri`.
    pub fn did_change_active(&self, uri: &str) {
        self.shared.diagnostic.focused(uri);
    }

    /// Send every delayed `didOpen` now.
    pub async fn flush_pending_opens(&self) {
        self.shared.sync.shared.flush_pending_opens().await;
    }

    /// Push the synchronized settings sections again.
    pub fn notify_configuration_changed(&self) -> Result<()> {
        if self.shared.registry.is_disabled("workspace/didChangeConfiguration") {
            return Ok(());
        }
        self.shared.configuration.send()
    }
}

impl ClientShared {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&self, new: ClientState) {
        let old = self.state.send_replace(new);
        if old != new {
            tracing::info!(client = %self.name, %old, %new, "state changed");
            let _ = self.events.send(ClientEvent::StateChanged { old, new });
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn wait_running(&self, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(LspError::Cancelled);
        }
        let mut states = self.state.subscribe();
        let state = tokio::select! {
            state = states.wait_for(|s| *s != ClientState::Starting) => {
                state.map(|s| *s).map_err(|_| LspError::NotRunning)?
            }
            () = token.cancelled() => return Err(LspError::Cancelled),
        };
        if state == ClientState::Running {
            Ok(())
        } else {
            Err(LspError::NotRunning)
        }
    }

    /// Start with the lifecycle lock held.
    async fn start_locked(self: &Arc<Self>) -> Result<()> {
        self.set_state(ClientState::Starting);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.launch().await {
                Ok(()) => {
                    self.set_state(ClientState::Running);
                    return Ok(());
                }
                Err(Launch::Transport(e)) => {
                    tracing::warn!(client = %self.name, "failed to start server: {e}");
                    self.set_state(ClientState::StartFailed);
                    return Err(e);
                }
                Err(Launch::Initialize(e)) => {
                    self.teardown().await;
                    if (self.initialization_failed)(&e, attempt) {
                        continue;
                    }
                    tracing::warn!(client = %self.name, attempt, "initialization failed: {e}");
                    self.set_state(ClientState::StartFailed);
                    return Err(e);
                }
            }
        }
    }

    async fn launch(self: &Arc<Self>) -> std::result::Result<(), Launch> {
        let transport = transport::open(&self.options.server)
            .await
            .map_err(Launch::Transport)?;
        let (reader, writer, framing, child) = transport.into_parts();

        let (connection_events, connection_events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Connection::new(
            self.name.clone(),
            reader,
            writer,
            framing,
            self.handlers.clone(),
            connection_events,
        ));
        *lock(&self.session) = Some(Session {
            connection: connection.clone(),
            child,
        });
        self.connection.set(Some(connection.clone()));

        let (push, push_rx) = mpsc::unbounded_channel();
        *lock(&self.push) = Some(push);
        tokio::spawn(publish_pushed(self.publisher.clone(), push_rx));

        let generation = self.current_generation();
        tokio::spawn(supervise(Arc::downgrade(self), connection_events_rx, generation));

        self.initialize(&connection).await.map_err(Launch::Initialize)
    }

    async fn initialize(&self, connection: &Connection) -> Result<()> {
        let mut capabilities = json!({});
        self.registry.fill_client_capabilities(&mut capabilities);

        let root = self.workspace.root_path();
        let root_uri = root
            .as_deref()
            .and_then(|path| protocol::path_to_file_uri(path).ok())
            .map(|uri| uri.to_string());
        let mut params = json!({
            "processId": std::process::id(),
            "clientInfo": { "name": "tether", "version": env!("CARGO_PKG_VERSION") },
            "rootPath": root.as_ref().map(|p| p.display().to_string()),
            "rootUri": root_uri,
            "workspaceFolders": self.workspace_folders(),
            "capabilities": capabilities,
            "trace": "off",
        });
        if let Some(options) = &self.options.initialization_options {
            params["initializationOptions"] = options.clone();
        }

        tracing::debug!(client = %self.name, "sending initialize");
        let token = CancellationToken::new();
        let response = tokio::time::timeout(
            Duration::from_secs(INIT_TIMEOUT_SECS),
            connection.request("initialize", Some(params), token.clone()),
        )
        .await
        .map_err(|_| {
            token.cancel();
            LspError::Timeout("initialize")
        })?
        .map_err(|e| LspError::InitializationFailed(e.to_string()))?;

        let result: InitializeResult = serde_json::from_value(response)
            .map_err(|e| LspError::InitializationFailed(format!("malformed initialize result: {e}")))?;
        if let Some(info) = &result.server_info {
            tracing::info!(client = %self.name, server = %info.name, version = ?info.version, "server initialized");
        }
        {
            let mut server = lock(&self.server);
            server.capabilities = Some(result.capabilities.clone());
            server.info = result.server_info;
        }

        connection.notify("initialized", Some(json!({})))?;
        self.registry
            .initialize(&result.capabilities, self.options.document_selector.as_ref());
        if !self.registry.is_disabled("workspace/didChangeConfiguration")
            && let Err(e) = self.configuration.send()
        {
            tracing::warn!(client = %self.name, "sending configuration failed: {e}");
        }
        Ok(())
    }

    fn workspace_folders(&self) -> Value {
        let folders: Vec<Value> = self
            .workspace
            .workspace_folders()
            .iter()
            .filter_map(|path| folder(path))
            .collect();
        if folders.is_empty() {
            Value::Null
        } else {
            Value::Array(folders)
        }
    }

    /// Stop with the lifecycle lock held.
    async fn stop_locked(&self) -> Result<()> {
        if !matches!(self.state(), ClientState::Running | ClientState::Starting) {
            return Ok(());
        }
        self.set_state(ClientState::Stopping);
        if let Some(connection) = self.connection.get() {
            connection.fail_pending(|| LspError::NotRunning).await;
        }
        let result = self.shutdown().await;
        self.teardown().await;
        self.collection.clear();
        self.set_state(ClientState::Stopped);
        result
    }

    /// `shutdown` then `exit`.
    async fn shutdown(&self) -> Result<()> {
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        let token = CancellationToken::new();
        let response = tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            connection.request("shutdown", None, token.clone()),
        )
        .await;
        match response {
            Ok(Ok(_)) => connection.notify("exit", None),
            Ok(Err(e)) => {
                tracing::warn!(client = %self.name, "shutdown request failed: {e}");
                Err(e)
            }
            Err(_) => {
                token.cancel();
                tracing::warn!(client = %self.name, "server did not answer shutdown in time");
                Err(LspError::Timeout("shutdown"))
            }
        }
    }

    /// Drop the connection and process and forget per-connection state.
    async fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connection.set(None);
        lock(&self.push).take();
        self.registry.clear();
        *lock(&self.server) = ServerData::default();

        let session = lock(&self.session).take();
        let Some(mut session) = session else {
            return;
        };
        session.connection.close().await;
        if let Some(mut child) = session.child.take() {
            match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(client = %self.name, %status, "server exited"),
                Ok(Err(e)) => tracing::debug!(client = %self.name, "waiting for server failed: {e}"),
                Err(_) => {
                    tracing::debug!(client = %self.name, "server didn't exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    /// The connection of `generation` failed or closed while running.
    async fn connection_lost(self: &Arc<Self>, generation: u64, error: Option<(String, u32)>) {
        let _guard = self.lifecycle.lock().await;
        if generation != self.current_generation() || self.state() != ClientState::Running {
            return;
        }

        if let Some((message, count)) = error {
            if self.error_handler.error(&message, count) == ErrorAction::Continue {
                return;
            }
            tracing::warn!(client = %self.name, "shutting down after connection errors");
            self.teardown().await;
            self.set_state(ClientState::Stopped);
            return;
        }

        tracing::warn!(client = %self.name, "connection to server closed unexpectedly");
        self.teardown().await;
        let decision = self.error_handler.closed();
        match decision.action {
            CloseAction::Restart => {
                tracing::info!(client = %self.name, "restarting server");
                if let Err(e) = self.start_locked().await {
                    tracing::warn!(client = %self.name, "restart failed: {e}");
                }
            }
            CloseAction::DoNotRestart => {
                if let Some(message) = decision.message {
                    let _ = self.events.send(ClientEvent::ShowMessage {
                        kind: MessageType::Error,
                        message,
                    });
                }
                self.set_state(ClientState::Stopped);
            }
        }
    }
}

enum Launch {
    /// The server could not be reached at all.
    Transport(LspError),
    /// The handshake failed; eligible for retry.
    Initialize(LspError),
}

fn folder(path: &Path) -> Option<Value> {
    let uri = protocol::path_to_file_uri(path).ok()?;
    let name = path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    );
    Some(json!({ "uri": uri.as_str(), "name": name }))
}

/// Route connection events of one session into the restart policy.
///
/// Returns a boxed future because restarting spawns the next supervisor.
fn supervise(
    client: Weak<ClientShared>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    generation: u64,
) -> BoxFuture<'static, ()> {
    async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = client.upgrade() else {
                return;
            };
            match event {
                ConnectionEvent::Error { message, count } => {
                    shared.connection_lost(generation, Some((message, count))).await;
                }
                ConnectionEvent::Closed => {
                    shared.connection_lost(generation, None).await;
                    return;
                }
            }
        }
    }
    .boxed()
}

/// Apply pushed diagnostics in arrival order.
async fn publish_pushed(
    publisher: DiagnosticPublisher,
    mut rx: mpsc::UnboundedReceiver<PublishDiagnosticsParams>,
) {
    while let Some(params) = rx.recv().await {
        publisher.publish(params.uri, params.diagnostics).await;
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, ResponseError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ResponseError::new(INVALID_PARAMS, e.to_string()))
}

fn request_handler<F>(client: &Arc<ClientShared>, handle: F) -> crate::connection::RequestHandler
where
    F: Fn(&Arc<ClientShared>, Option<Value>) -> std::result::Result<Value, ResponseError>
        + Send
        + Sync
        + 'static,
{
    let client = Arc::downgrade(client);
    Arc::new(move |params: Option<Value>| {
        let outcome = match client.upgrade() {
            Some(shared) => handle(&shared, params),
            None => Err(ResponseError::new(
                protocol::REQUEST_FAILED,
                "language client is gone",
            )),
        };
        async move { outcome }.boxed()
    })
}

fn notification_handler<F>(client: &Arc<ClientShared>, handle: F) -> crate::connection::NotificationHandler
where
    F: Fn(&Arc<ClientShared>, Option<Value>) + Send + Sync + 'static,
{
    let client = Arc::downgrade(client);
    Arc::new(move |params: Option<Value>| {
        if let Some(shared) = client.upgrade() {
            handle(&shared, params);
        }
    })
}

fn install_builtin_handlers(client: &Arc<ClientShared>) {
    let handlers = &client.handlers;

    handlers.on_request(
        "client/registerCapability",
        request_handler(client, |shared, params| {
            let params: RegistrationParams = parse(params)?;
            shared.registry.handle_register(params)?;
            Ok(Value::Null)
        }),
    );
    handlers.on_request(
        "client/unregisterCapability",
        request_handler(client, |shared, params| {
            let params: UnregistrationParams = parse(params)?;
            shared.registry.handle_unregister(params)?;
            Ok(Value::Null)
        }),
    );
    handlers.on_request(
        "workspace/configuration",
        request_handler(client, |shared, params| {
            let params: ConfigurationParams = parse(params)?;
            Ok(configuration_response(shared.workspace.as_ref(), &params))
        }),
    );
    handlers.on_request(
        "workspace/workspaceFolders",
        request_handler(client, |shared, _params| Ok(shared.workspace_folders())),
    );
    handlers.on_request(
        "window/workDoneProgress/create",
        request_handler(client, |_shared, _params| Ok(Value::Null)),
    );
    handlers.on_request(
        "workspace/diagnostic/refresh",
        request_handler(client, |shared, _params| {
            tracing::debug!(client = %shared.name, "server requested a diagnostic refresh");
            shared.diagnostic.refresh();
            Ok(Value::Null)
        }),
    );
    handlers.on_request(
        "window/showMessageRequest",
        request_handler(client, |shared, params| {
            let params: MessageParams = parse(params)?;
            let _ = shared.events.send(ClientEvent::ShowMessage {
                kind: params.kind,
                message: params.message,
            });
            Ok(Value::Null)
        }),
    );

    handlers.on_notification(
        "textDocument/publishDiagnostics",
        notification_handler(client, |shared, params| {
            match parse::<PublishDiagnosticsParams>(params) {
                Ok(params) => {
                    if let Some(push) = lock(&shared.push).as_ref() {
                        let _ = push.send(params);
                    }
                }
                Err(e) => tracing::debug!(client = %shared.name, "malformed publishDiagnostics: {}", e.message),
            }
        }),
    );
    handlers.on_notification(
        "window/logMessage",
        notification_handler(client, |shared, params| {
            let Ok(params) = parse::<MessageParams>(params) else {
                return;
            };
            let server = shared.name.as_str();
            match params.kind {
                MessageType::Error => tracing::error!(%server, "{}", params.message),
                MessageType::Warning => tracing::warn!(%server, "{}", params.message),
                MessageType::Info => tracing::info!(%server, "{}", params.message),
                MessageType::Log => tracing::debug!(%server, "{}", params.message),
            }
            let _ = shared.events.send(ClientEvent::LogMessage {
                kind: params.kind,
                message: params.message,
            });
        }),
    );
    handlers.on_notification(
        "window/showMessage",
        notification_handler(client, |shared, params| {
            let Ok(params) = parse::<MessageParams>(params) else {
                return;
            };
            tracing::info!(server = %shared.name, "{}", params.message);
            let _ = shared.events.send(ClientEvent::ShowMessage {
                kind: params.kind,
                message: params.message,
            });
        }),
    );
    handlers.on_notification(
        "$/progress",
        notification_handler(client, |shared, params| {
            if let Ok(params) = parse::<ProgressParams>(params) {
                let _ = shared.events.send(ClientEvent::Progress {
                    token: params.token,
                    value: params.value,
                });
            }
        }),
    );
    handlers.on_notification(
        "$/logTrace",
        notification_handler(client, |shared, params| {
            let message = params
                .as_ref()
                .and_then(|p| p.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            tracing::trace!(server = %shared.name, "{message}");
        }),
    );
}
