//! Text document synchronization.
//!
//! Six dynamic features (`didOpen`, `didChange`, `willSave`,
//! `willSaveWaitUntil`, `didSave`, `didClose`) share one [`SyncShared`]
//! holding the documents the server currently knows about. A change, save or
//! close is only sent for a document the server was told is open.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use globset::GlobSet;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{
    DynamicFeature, RegistrationData, Registrations, build_ignored, ensure, new_id,
    registration_selector,
};
use crate::connection::ConnectionSlot;
use crate::error::Result;
use crate::lock;
use crate::middleware::{self, Middleware, Next};
use crate::protocol;
use crate::selector::{self, DocumentSelector};
use crate::types::{
    TextDocument, TextDocumentChangeEvent, TextDocumentContentChangeEvent, TextEdit,
    WillSaveEvent,
};
use crate::workspace::Workspace;

/// How document changes are sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncKind {
    #[default]
    None,
    Full,
    Incremental,
}

impl SyncKind {
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Full),
            2 => Some(Self::Incremental),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_lsp(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Full => 1,
            Self::Incremental => 2,
        }
    }
}

/// `textDocumentSync` as declared in the server capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SyncOptions {
    open_close: bool,
    change: SyncKind,
    will_save: bool,
    will_save_wait_until: bool,
    /// `Some(include_text)` when saves are wanted.
    save: Option<bool>,
}

fn sync_options(capabilities: &Value) -> SyncOptions {
    match capabilities.get("textDocumentSync") {
        Some(Value::Number(kind)) => {
            let change = kind.as_u64().and_then(SyncKind::from_lsp).unwrap_or_default();
            if change == SyncKind::None {
                return SyncOptions::default();
            }
            SyncOptions {
                open_close: true,
                change,
                save: Some(false),
                ..SyncOptions::default()
            }
        }
        Some(Value::Object(options)) => {
            let flag = |key: &str| options.get(key).and_then(Value::as_bool).unwrap_or(false);
            SyncOptions {
                open_close: flag("openClose"),
                change: options
                    .get("change")
                    .and_then(Value::as_u64)
                    .and_then(SyncKind::from_lsp)
                    .unwrap_or_default(),
                will_save: flag("willSave"),
                will_save_wait_until: flag("willSaveWaitUntil"),
                save: match options.get("save") {
                    Some(Value::Bool(true)) => Some(false),
                    Some(Value::Object(save)) => Some(
                        save.get("includeText")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    ),
                    _ => None,
                },
            }
        }
        _ => SyncOptions::default(),
    }
}

/// Observes notifications after they were sent.
pub(crate) trait SyncListener: Send + Sync {
    fn did_open(&self, _document: &TextDocument) {}
    fn did_change(&self, _document: &TextDocument) {}
    fn did_save(&self, _document: &TextDocument) {}
    fn did_close(&self, _document: &TextDocument) {}
}

#[derive(Debug, Default)]
struct PendingOpens {
    order: VecDeque<String>,
    documents: HashMap<String, TextDocument>,
}

impl PendingOpens {
    fn take(&mut self, uri: &str) -> Option<TextDocument> {
        let document = self.documents.remove(uri)?;
        self.order.retain(|u| u != uri);
        Some(document)
    }
}

/// Settings shared by the sync features.
pub(crate) struct SyncConfig {
    pub connection: ConnectionSlot,
    pub middleware: Middleware,
    pub workspace: Arc<dyn Workspace>,
    pub client_selector: Option<DocumentSelector>,
    /// Path globs of documents never synced.
    pub ignored: Vec<String>,
    pub delay_open: bool,
    pub will_save_wait_until_timeout: Duration,
}

/// Documents the server knows about, plus opens waiting for visibility.
pub(crate) struct SyncShared {
    config: SyncConfig,
    ignored: GlobSet,
    synced: Mutex<HashMap<String, TextDocument>>,
    /// Opens still running their middleware. Held until the open settles so
    /// later notifications for the document queue behind it.
    opening: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<PendingOpens>,
    listeners: Mutex<Vec<Weak<dyn SyncListener>>>,
}

impl SyncShared {
    pub fn new(config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            ignored: build_ignored(&config.ignored),
            config,
            synced: Mutex::default(),
            opening: Mutex::default(),
            pending: Mutex::default(),
            listeners: Mutex::default(),
        })
    }

    /// Wait until an in-progress open of `uri` was sent or dropped. The
    /// guard keeps the next open of `uri` from starting while it is held.
    async fn open_gate(&self, uri: &str) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let gate = lock(&self.opening).get(uri).cloned()?;
        Some(gate.lock_owned().await)
    }

    pub fn add_listener(&self, listener: Weak<dyn SyncListener>) {
        lock(&self.listeners).push(listener);
    }

    fn emit(&self, notify: impl Fn(&dyn SyncListener)) {
        let listeners: Vec<Arc<dyn SyncListener>> =
            lock(&self.listeners).iter().filter_map(Weak::upgrade).collect();
        for listener in listeners {
            notify(listener.as_ref());
        }
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.config.workspace
    }

    pub fn connection(&self) -> &ConnectionSlot {
        &self.config.connection
    }

    fn selector_for(&self, register_options: &Value) -> Result<Option<DocumentSelector>> {
        registration_selector(register_options, self.config.client_selector.as_ref())
    }

    /// Whether the host lets `document` reach the server at all, whatever
    /// the server registered.
    #[must_use]
    pub fn accepts(&self, document: &TextDocument) -> bool {
        selector::matches(self.config.client_selector.as_ref(), document)
            && !protocol::file_uri_to_path(document.uri())
                .is_some_and(|path| self.ignored.is_match(path))
    }

    #[must_use]
    pub fn is_synced(&self, uri: &str) -> bool {
        lock(&self.synced).contains_key(uri)
    }

    /// The server's view of `uri`.
    #[must_use]
    pub fn synced_document(&self, uri: &str) -> Option<TextDocument> {
        lock(&self.synced).get(uri).cloned()
    }

    #[must_use]
    pub fn synced_documents(&self) -> Vec<TextDocument> {
        let mut documents: Vec<TextDocument> = lock(&self.synced).values().cloned().collect();
        documents.sort_by(|a, b| a.uri().cmp(b.uri()));
        documents
    }

    #[must_use]
    pub fn pending_uris(&self) -> Vec<String> {
        lock(&self.pending).order.iter().cloned().collect()
    }

    fn update_synced(&self, document: &TextDocument) {
        if let Some(entry) = lock(&self.synced).get_mut(document.uri()) {
            *entry = document.clone();
        }
    }

    /// Replace a parked open's snapshot. Returns false when not parked.
    fn update_pending(&self, document: &TextDocument) -> bool {
        match lock(&self.pending).documents.get_mut(document.uri()) {
            Some(entry) => {
                *entry = document.clone();
                true
            }
            None => false,
        }
    }

    /// Open `document` on the server, or park it while delayed opens are on
    /// and it is not visible.
    async fn open(self: &Arc<Self>, document: TextDocument) {
        let uri = document.uri().to_string();
        if self.is_synced(&uri) {
            return;
        }
        if self.config.delay_open && !self.config.workspace.is_visible(&uri) {
            let mut pending = lock(&self.pending);
            if pending.documents.insert(uri.clone(), document).is_none() {
                pending.order.push_back(uri.clone());
            }
            tracing::debug!(%uri, "delaying didOpen until visible");
            return;
        }
        self.send_open(document).await;
    }

    async fn send_open(self: &Arc<Self>, document: TextDocument) {
        let uri = document.uri().to_string();
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let _opening = gate.clone().lock_owned().await;
        {
            // Reserve so concurrent opens of the same document send once.
            let mut opening = lock(&self.opening);
            if opening.contains_key(&uri) || self.is_synced(&uri) {
                return;
            }
            opening.insert(uri.clone(), gate);
        }

        let sent = Arc::new(AtomicBool::new(false));
        let shared = self.clone();
        let sent_flag = sent.clone();
        let next: Next<TextDocument> = Box::new(move |document: TextDocument| {
            async move {
                shared.config.connection.notify(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(&document)),
                )?;
                sent_flag.store(true, Ordering::SeqCst);
                lock(&shared.synced).insert(document.uri().to_string(), document.clone());
                shared.emit(|l| l.did_open(&document));
                Ok(())
            }
            .boxed()
        });

        if let Err(e) = middleware::run(self.config.middleware.did_open_hook(), document, next).await {
            tracing::warn!(%uri, "didOpen dropped: {e}");
        }
        if !sent.load(Ordering::SeqCst) {
            tracing::debug!(%uri, "didOpen was not sent");
        }
        lock(&self.opening).remove(&uri);
    }

    /// Send every parked open.
    pub async fn flush_pending_opens(self: &Arc<Self>) {
        let documents: Vec<TextDocument> = {
            let mut pending = lock(&self.pending);
            let order: Vec<String> = pending.order.drain(..).collect();
            order
                .iter()
                .filter_map(|uri| pending.documents.remove(uri))
                .collect()
        };
        for document in documents {
            self.send_open(document).await;
        }
    }

    /// Send the parked opens of documents that became visible.
    pub async fn open_visible(self: &Arc<Self>, uris: &[String]) {
        let documents: Vec<TextDocument> = {
            let mut pending = lock(&self.pending);
            uris.iter().filter_map(|uri| pending.take(uri)).collect()
        };
        for document in documents {
            self.send_open(document).await;
        }
    }

    async fn send_close(self: &Arc<Self>, document: TextDocument) {
        let shared = self.clone();
        let next: Next<TextDocument> = Box::new(move |document: TextDocument| {
            async move {
                shared.config.connection.notify(
                    "textDocument/didClose",
                    Some(protocol::did_close_params(&document)),
                )
            }
            .boxed()
        });
        let uri = document.uri().to_string();
        if let Err(e) =
            middleware::run(self.config.middleware.did_close_hook(), document.clone(), next).await
        {
            tracing::warn!(%uri, "didClose dropped: {e}");
        }
        lock(&self.synced).remove(&uri);
        self.emit(|l| l.did_close(&document));
    }

    /// Forget every synced and parked document.
    pub fn reset(&self) {
        lock(&self.synced).clear();
        let mut pending = lock(&self.pending);
        pending.order.clear();
        pending.documents.clear();
    }
}

fn enable_dynamic_sync(capabilities: &mut Value, key: Option<&str>) {
    let sync = ensure(capabilities, &["textDocument", "synchronization"]);
    sync.insert("dynamicRegistration".into(), json!(true));
    if let Some(key) = key {
        sync.insert(key.into(), json!(true));
    }
}

// ── didOpen ─────────────────────────────────────────────────────────────

pub struct DidOpenFeature {
    shared: Arc<SyncShared>,
    registrations: Mutex<Registrations<()>>,
}

impl DidOpenFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    #[must_use]
    pub fn matches(&self, document: &TextDocument) -> bool {
        lock(&self.registrations).matches(document)
    }

    pub(crate) async fn did_open(&self, document: TextDocument) {
        if !self.shared.accepts(&document) {
            tracing::trace!(uri = %document.uri(), "document excluded by the client filter");
            return;
        }
        if !self.matches(&document) {
            tracing::trace!(uri = %document.uri(), "no didOpen registration matches");
            return;
        }
        self.shared.open(document).await;
    }

    /// Open the host's documents that a new registration covers.
    fn open_known_documents(&self, selector: Option<DocumentSelector>) {
        let documents: Vec<TextDocument> = self
            .shared
            .config
            .workspace
            .text_documents()
            .into_iter()
            .filter(|d| {
                self.shared.accepts(d)
                    && selector::matches(selector.as_ref(), d)
                    && !self.shared.is_synced(d.uri())
            })
            .collect();
        if documents.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            for document in documents {
                let current = shared
                    .config
                    .workspace
                    .document(document.uri())
                    .unwrap_or(document);
                shared.open(current).await;
            }
        });
    }
}

impl DynamicFeature for DidOpenFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/didOpen"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, None);
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if sync_options(server_capabilities).open_close
            && let Err(e) = self.register(RegistrationData::new(new_id(), json!({})))
        {
            tracing::warn!("didOpen registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        lock(&self.registrations).insert(registration.id, selector.clone(), ());
        self.open_known_documents(selector);
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).remove(id);
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations)
            .best(document)
            .map(|r| RegistrationData::new(r.id.clone(), json!({})))
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
        self.shared.reset();
    }
}

// ── didChange ───────────────────────────────────────────────────────────

pub struct DidChangeFeature {
    shared: Arc<SyncShared>,
    registrations: Mutex<Registrations<SyncKind>>,
}

impl DidChangeFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    /// Sync kind negotiated for `document`, if any registration covers it.
    #[must_use]
    pub fn sync_kind(&self, document: &TextDocument) -> Option<SyncKind> {
        lock(&self.registrations).best(document).map(|r| r.provider)
    }

    pub(crate) async fn did_change(&self, event: TextDocumentChangeEvent) {
        if event.content_changes.is_empty() {
            return;
        }
        if self.shared.update_pending(&event.document) {
            return;
        }
        let _gate = self.shared.open_gate(event.document.uri()).await;
        if !self.shared.is_synced(event.document.uri()) {
            tracing::trace!(uri = %event.document.uri(), "change for a document the server has not opened");
            return;
        }

        let kind = self.sync_kind(&event.document);
        let Some(kind @ (SyncKind::Full | SyncKind::Incremental)) = kind else {
            self.shared.update_synced(&event.document);
            return;
        };

        let shared = self.shared.clone();
        let next: Next<TextDocumentChangeEvent> = Box::new(move |event: TextDocumentChangeEvent| {
            async move {
                let changes = match kind {
                    SyncKind::Full => vec![TextDocumentContentChangeEvent::full(event.document.text())],
                    _ => event.content_changes.clone(),
                };
                shared.config.connection.notify(
                    "textDocument/didChange",
                    Some(protocol::did_change_params(&event.document, &changes)),
                )?;
                shared.update_synced(&event.document);
                shared.emit(|l| l.did_change(&event.document));
                Ok(())
            }
            .boxed()
        });

        let uri = event.document.uri().to_string();
        if let Err(e) =
            middleware::run(self.shared.config.middleware.did_change_hook(), event, next).await
        {
            tracing::warn!(%uri, "didChange dropped: {e}");
        }
    }
}

impl DynamicFeature for DidChangeFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/didChange"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, None);
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        let change = sync_options(server_capabilities).change;
        if change != SyncKind::None
            && let Err(e) = self.register(RegistrationData::new(
                new_id(),
                json!({ "syncKind": change.as_lsp() }),
            ))
        {
            tracing::warn!("didChange registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        let kind = registration
            .register_options
            .get("syncKind")
            .and_then(Value::as_u64)
            .and_then(SyncKind::from_lsp)
            .unwrap_or(SyncKind::Full);
        lock(&self.registrations).insert(registration.id, selector, kind);
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).remove(id);
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations).best(document).map(|r| {
            RegistrationData::new(r.id.clone(), json!({ "syncKind": r.provider.as_lsp() }))
        })
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}

// ── willSave ────────────────────────────────────────────────────────────

pub struct WillSaveFeature {
    shared: Arc<SyncShared>,
    registrations: Mutex<Registrations<()>>,
}

impl WillSaveFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    pub(crate) async fn will_save(&self, event: WillSaveEvent) {
        let _gate = self.shared.open_gate(event.document.uri()).await;
        if !self.shared.is_synced(event.document.uri())
            || !lock(&self.registrations).matches(&event.document)
        {
            return;
        }
        let connection = self.shared.config.connection.clone();
        let next: Next<WillSaveEvent> = Box::new(move |event: WillSaveEvent| {
            async move {
                connection.notify(
                    "textDocument/willSave",
                    Some(protocol::will_save_params(&event.document, event.reason)),
                )
            }
            .boxed()
        });
        let uri = event.document.uri().to_string();
        if let Err(e) =
            middleware::run(self.shared.config.middleware.will_save_hook(), event, next).await
        {
            tracing::warn!(%uri, "willSave dropped: {e}");
        }
    }
}

impl DynamicFeature for WillSaveFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/willSave"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, Some("willSave"));
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if sync_options(server_capabilities).will_save
            && let Err(e) = self.register(RegistrationData::new(new_id(), json!({})))
        {
            tracing::warn!("willSave registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        lock(&self.registrations).insert(registration.id, selector, ());
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).remove(id);
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations)
            .best(document)
            .map(|r| RegistrationData::new(r.id.clone(), json!({})))
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}

// ── willSaveWaitUntil ───────────────────────────────────────────────────

pub struct WillSaveWaitUntilFeature {
    shared: Arc<SyncShared>,
    registrations: Mutex<Registrations<()>>,
}

impl WillSaveWaitUntilFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    /// Edits to apply before saving. Empty on timeout or failure.
    pub(crate) async fn will_save_wait_until(&self, event: WillSaveEvent) -> Vec<TextEdit> {
        if !self.shared.is_synced(event.document.uri())
            || !lock(&self.registrations).matches(&event.document)
        {
            return Vec::new();
        }

        let connection = self.shared.config.connection.clone();
        let timeout = self.shared.config.will_save_wait_until_timeout;
        let next: Next<WillSaveEvent, Vec<TextEdit>> = Box::new(move |event: WillSaveEvent| {
            async move {
                let token = CancellationToken::new();
                let timer = {
                    let token = token.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        token.cancel();
                    })
                };
                let result = connection
                    .request(
                        "textDocument/willSaveWaitUntil",
                        Some(protocol::will_save_params(&event.document, event.reason)),
                        token,
                    )
                    .await;
                timer.abort();

                match result {
                    Ok(Value::Null) => Ok(Vec::new()),
                    Ok(edits) => serde_json::from_value(edits).map_err(|e| {
                        crate::error::LspError::Protocol(format!("invalid text edits: {e}"))
                    }),
                    Err(e) if e.is_cancellation() => {
                        tracing::warn!(
                            uri = %event.document.uri(),
                            "willSaveWaitUntil timed out after {}ms; saving without edits",
                            timeout.as_millis()
                        );
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e),
                }
            }
            .boxed()
        });

        let uri = event.document.uri().to_string();
        match middleware::run(
            self.shared.config.middleware.will_save_wait_until_hook(),
            event,
            next,
        )
        .await
        {
            Ok(edits) => edits,
            Err(e) => {
                tracing::warn!(%uri, "willSaveWaitUntil failed: {e}");
                Vec::new()
            }
        }
    }
}

impl DynamicFeature for WillSaveWaitUntilFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/willSaveWaitUntil"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, Some("willSaveWaitUntil"));
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if sync_options(server_capabilities).will_save_wait_until
            && let Err(e) = self.register(RegistrationData::new(new_id(), json!({})))
        {
            tracing::warn!("willSaveWaitUntil registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        lock(&self.registrations).insert(registration.id, selector, ());
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).remove(id);
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations)
            .best(document)
            .map(|r| RegistrationData::new(r.id.clone(), json!({})))
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}

// ── didSave ─────────────────────────────────────────────────────────────

pub struct DidSaveFeature {
    shared: Arc<SyncShared>,
    /// Provider: whether to include the text.
    registrations: Mutex<Registrations<bool>>,
}

impl DidSaveFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    pub(crate) async fn did_save(&self, document: TextDocument) {
        let _gate = self.shared.open_gate(document.uri()).await;
        if !self.shared.is_synced(document.uri()) {
            return;
        }
        let Some(include_text) = lock(&self.registrations).best(&document).map(|r| r.provider)
        else {
            return;
        };

        let shared = self.shared.clone();
        let next: Next<TextDocument> = Box::new(move |document: TextDocument| {
            async move {
                shared.config.connection.notify(
                    "textDocument/didSave",
                    Some(protocol::did_save_params(&document, include_text)),
                )?;
                shared.emit(|l| l.did_save(&document));
                Ok(())
            }
            .boxed()
        });
        let uri = document.uri().to_string();
        if let Err(e) =
            middleware::run(self.shared.config.middleware.did_save_hook(), document, next).await
        {
            tracing::warn!(%uri, "didSave dropped: {e}");
        }
    }
}

impl DynamicFeature for DidSaveFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/didSave"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, Some("didSave"));
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if let Some(include_text) = sync_options(server_capabilities).save
            && let Err(e) = self.register(RegistrationData::new(
                new_id(),
                json!({ "includeText": include_text }),
            ))
        {
            tracing::warn!("didSave registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        let include_text = registration
            .register_options
            .get("includeText")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        lock(&self.registrations).insert(registration.id, selector, include_text);
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).remove(id);
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations).best(document).map(|r| {
            RegistrationData::new(r.id.clone(), json!({ "includeText": r.provider }))
        })
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}

// ── didClose ────────────────────────────────────────────────────────────

pub struct DidCloseFeature {
    shared: Arc<SyncShared>,
    registrations: Mutex<Registrations<()>>,
}

impl DidCloseFeature {
    pub(crate) fn new(shared: Arc<SyncShared>) -> Self {
        Self {
            shared,
            registrations: Mutex::default(),
        }
    }

    pub(crate) async fn did_close(&self, document: TextDocument) {
        let uri = document.uri().to_string();
        if lock(&self.shared.pending).take(&uri).is_some() {
            tracing::debug!(%uri, "closed before its delayed didOpen was sent");
            return;
        }
        let _gate = self.shared.open_gate(&uri).await;
        let Some(synced) = self.shared.synced_document(&uri) else {
            return;
        };

        if lock(&self.registrations).matches(&synced) {
            self.shared.send_close(synced).await;
        } else {
            lock(&self.shared.synced).remove(&uri);
            self.shared.emit(|l| l.did_close(&synced));
        }
    }
}

impl DynamicFeature for DidCloseFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/didClose"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        enable_dynamic_sync(capabilities, None);
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if sync_options(server_capabilities).open_close
            && let Err(e) = self.register(RegistrationData::new(new_id(), json!({})))
        {
            tracing::warn!("didClose registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = self.shared.selector_for(&registration.register_options)?;
        lock(&self.registrations).insert(registration.id, selector, ());
        Ok(())
    }

    /// Close documents that only the removed registration covered.
    fn unregister(&self, id: &str) {
        let orphans: Vec<TextDocument> = {
            let mut registrations = lock(&self.registrations);
            let Some(removed) = registrations.remove(id) else {
                return;
            };
            self.shared
                .synced_documents()
                .into_iter()
                .filter(|d| selector::matches(removed.selector.as_ref(), d) && !registrations.matches(d))
                .collect()
        };
        if orphans.is_empty() {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            for document in orphans {
                shared.send_close(document).await;
            }
        });
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.registrations)
            .best(document)
            .map(|r| RegistrationData::new(r.id.clone(), json!({})))
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}

/// The sync features of one client.
pub(crate) struct SyncFeatures {
    pub shared: Arc<SyncShared>,
    pub did_open: Arc<DidOpenFeature>,
    pub did_change: Arc<DidChangeFeature>,
    pub will_save: Arc<WillSaveFeature>,
    pub will_save_wait_until: Arc<WillSaveWaitUntilFeature>,
    pub did_save: Arc<DidSaveFeature>,
    pub did_close: Arc<DidCloseFeature>,
}

impl SyncFeatures {
    pub fn new(config: SyncConfig) -> Self {
        let shared = SyncShared::new(config);
        Self {
            did_open: Arc::new(DidOpenFeature::new(shared.clone())),
            did_change: Arc::new(DidChangeFeature::new(shared.clone())),
            will_save: Arc::new(WillSaveFeature::new(shared.clone())),
            will_save_wait_until: Arc::new(WillSaveWaitUntilFeature::new(shared.clone())),
            did_save: Arc::new(DidSaveFeature::new(shared.clone())),
            did_close: Arc::new(DidCloseFeature::new(shared.clone())),
            shared,
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn DynamicFeature>> {
        vec![
            self.did_open.clone(),
            self.did_change.clone(),
            self.will_save.clone(),
            self.will_save_wait_until.clone(),
            self.did_save.clone(),
            self.did_close.clone(),
        ]
    }
}
