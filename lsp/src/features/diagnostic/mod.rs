//! Pull diagnostics (`textDocument/diagnostic` and `workspace/diagnostic`).
//!
//! Document pulls go through one [`BackgroundScheduler`] per connection so a
//! single pull is in flight at a time. Workspace pulls run in their own loop,
//! debounced between rounds, with partial results applied as they stream in.

pub mod scheduler;
pub mod tracker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use scheduler::{BackgroundScheduler, PullOutcome, PullRequestor};
pub use tracker::{DocumentPullState, DocumentPullStateTracker, PreviousResultId, PullState};

use super::sync::{SyncListener, SyncShared};
use super::{
    DynamicFeature, RegistrationData, Registrations, build_ignored, ensure, new_id,
    registration_selector, static_registration,
};
use crate::config::{DiagnosticPullOptions, PullTrigger};
use crate::connection::Handlers;
use crate::diagnostics::DiagnosticPublisher;
use crate::error::{LspError, Result};
use crate::lock;
use crate::protocol::{self, SERVER_CANCELLED};
use crate::selector::DocumentSelector;
use crate::types::{Diagnostic, TextDocument};

/// Pause between two workspace pulls.
pub const WORKSPACE_PULL_DEBOUNCE_MS: u64 = 3000;

/// Consecutive workspace pull failures after which the loop gives up.
pub const WORKSPACE_PULL_MAX_ERRORS: u32 = 5;

/// `DiagnosticRegistrationOptions` minus the selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiagnosticOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    #[serde(default)]
    inter_file_dependencies: bool,
    #[serde(default)]
    workspace_diagnostics: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReportKind {
    #[default]
    Full,
    Unchanged,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentReport {
    #[serde(default)]
    kind: ReportKind,
    #[serde(default)]
    result_id: Option<String>,
    #[serde(default)]
    items: Vec<Diagnostic>,
    #[serde(default)]
    related_documents: HashMap<String, DocumentReport>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceDocumentReport {
    uri: String,
    #[serde(default)]
    version: Option<i32>,
    #[serde(flatten)]
    report: DocumentReport,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceReport {
    #[serde(default)]
    items: Vec<WorkspaceDocumentReport>,
}

/// What the diagnostic feature is built from.
pub(crate) struct DiagnosticConfig {
    pub sync: Arc<SyncShared>,
    pub handlers: Arc<Handlers>,
    pub publisher: DiagnosticPublisher,
    pub options: DiagnosticPullOptions,
    pub client_selector: Option<DocumentSelector>,
}

/// Issues the pulls and applies their results.
struct DocumentPuller {
    sync: Arc<SyncShared>,
    handlers: Arc<Handlers>,
    publisher: DiagnosticPublisher,
    options: DiagnosticPullOptions,
    ignored: GlobSet,
    registrations: Mutex<Registrations<DiagnosticOptions>>,
    tracker: Arc<DocumentPullStateTracker>,
    /// Documents the server cancelled without asking for a retry. They are
    /// skipped by refreshes until their next change.
    outdated: Mutex<HashSet<String>>,
    /// Token of the pull in flight per document, cancelled on close.
    open_requests: Mutex<HashMap<String, CancellationToken>>,
    /// Bumped per document on close. A report from an older epoch is stale.
    epochs: Mutex<HashMap<String, u64>>,
    cancel: Mutex<CancellationToken>,
    workspace_request: Mutex<Option<CancellationToken>>,
}

impl DocumentPuller {
    fn is_ignored(&self, uri: &str) -> bool {
        protocol::file_uri_to_path(uri).is_some_and(|path| self.ignored.is_match(path))
    }

    fn is_pullable(&self, document: &TextDocument) -> bool {
        lock(&self.registrations).matches(document)
            && self.sync.workspace().is_visible(document.uri())
            && !self.is_ignored(document.uri())
    }

    /// Whether results for `document` depend on other files.
    fn has_inter_file_dependencies(&self, document: &TextDocument) -> bool {
        lock(&self.registrations)
            .best(document)
            .is_some_and(|r| r.provider.inter_file_dependencies)
    }

    fn filtered(&self, document: &TextDocument, trigger: PullTrigger) -> bool {
        self.options
            .filter
            .as_ref()
            .is_some_and(|filter| filter(document, trigger))
    }

    fn session_token(&self) -> CancellationToken {
        lock(&self.cancel).child_token()
    }

    fn epoch(&self, uri: &str) -> u64 {
        lock(&self.epochs).get(uri).copied().unwrap_or(0)
    }

    /// Invalidate whatever pull of `uri` is in flight.
    fn invalidate(&self, uri: &str) {
        *lock(&self.epochs).entry(uri.to_string()).or_insert(0) += 1;
        if let Some(token) = lock(&self.open_requests).remove(uri) {
            token.cancel();
        }
    }

    async fn pull_document(&self, uri: String) -> PullOutcome {
        let Some(document) = self.sync.synced_document(&uri) else {
            tracing::trace!(%uri, "skipping pull for a document the server has not opened");
            return PullOutcome::Done;
        };
        if !self.is_pullable(&document) {
            self.tracker.untrack(PullState::Document, &uri);
            return PullOutcome::Done;
        }
        let Some(options) = lock(&self.registrations)
            .best(&document)
            .map(|r| r.provider.clone())
        else {
            return PullOutcome::Done;
        };

        let version = document.version();
        let state = self
            .tracker
            .track(PullState::Document, &uri, Some(version));
        let mut params = json!({ "textDocument": { "uri": uri } });
        if let Some(identifier) = &options.identifier {
            params["identifier"] = json!(identifier);
        }
        if let Some(previous) = state.result_id() {
            params["previousResultId"] = json!(previous);
        }

        tracing::debug!(%uri, version, "pulling document diagnostics");
        let epoch = self.epoch(&uri);
        let token = self.session_token();
        lock(&self.open_requests).insert(uri.clone(), token.clone());
        let result = self
            .sync
            .connection()
            .request("textDocument/diagnostic", Some(params), token)
            .await;
        lock(&self.open_requests).remove(&uri);
        if self.epoch(&uri) != epoch {
            tracing::debug!(%uri, "document closed during its pull; dropping the result");
            return PullOutcome::Done;
        }

        match result {
            Ok(value) => {
                let report = if value.is_null() {
                    DocumentReport::default()
                } else {
                    match serde_json::from_value::<DocumentReport>(value) {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::warn!(%uri, "malformed diagnostic report: {e}");
                            return PullOutcome::Done;
                        }
                    }
                };
                self.apply_document_report(&uri, version, report).await;
                PullOutcome::Done
            }
            Err(e) if e.retrigger_requested() => {
                tracing::debug!(%uri, "server cancelled the pull; retrying");
                PullOutcome::Reschedule
            }
            Err(e) if e.is_cancellation() => {
                if matches!(e, LspError::Response { code: SERVER_CANCELLED, .. }) {
                    lock(&self.outdated).insert(uri.clone());
                }
                tracing::debug!(%uri, "diagnostic pull cancelled: {e}");
                PullOutcome::Done
            }
            Err(e) => {
                tracing::warn!(%uri, "diagnostic pull failed: {e}");
                PullOutcome::Done
            }
        }
    }

    async fn apply_document_report(&self, uri: &str, version: i32, report: DocumentReport) {
        if !self.sync.is_synced(uri) {
            tracing::debug!(%uri, "dropping diagnostics for a closed document");
            return;
        }
        for (related, report) in report.related_documents {
            if report.kind == ReportKind::Full {
                self.publisher.publish(related, report.items).await;
            }
        }
        match report.kind {
            ReportKind::Full => {
                self.publisher.publish(uri.to_string(), report.items).await;
                self.tracker
                    .update(PullState::Document, uri, Some(version), report.result_id);
            }
            ReportKind::Unchanged => tracing::trace!(%uri, "diagnostics unchanged"),
        }
    }

    fn workspace_identifier(&self) -> Option<String> {
        lock(&self.registrations)
            .iter()
            .find(|r| r.provider.workspace_diagnostics)
            .and_then(|r| r.provider.identifier.clone())
    }

    async fn pull_workspace(&self) -> Result<()> {
        let partial_token = json!(new_id());
        let (chunks_tx, mut chunks) = mpsc::unbounded_channel();
        self.handlers.on_progress(
            &partial_token,
            Arc::new(move |value: Value| {
                let _ = chunks_tx.send(value);
            }),
        );

        let request_token = self.session_token();
        *lock(&self.workspace_request) = Some(request_token.clone());

        let mut params = json!({
            "previousResultIds": self.tracker.workspace_previous_result_ids(),
            "partialResultToken": partial_token,
        });
        if let Some(identifier) = self.workspace_identifier() {
            params["identifier"] = json!(identifier);
        }

        tracing::debug!("pulling workspace diagnostics");
        let connection = self.sync.connection().clone();
        let request = connection.request("workspace/diagnostic", Some(params), request_token);
        tokio::pin!(request);
        let result = loop {
            tokio::select! {
                Some(chunk) = chunks.recv() => self.apply_workspace_chunk(chunk).await,
                result = &mut request => break result,
            }
        };

        self.handlers.remove_progress(&partial_token);
        *lock(&self.workspace_request) = None;
        while let Ok(chunk) = chunks.try_recv() {
            self.apply_workspace_chunk(chunk).await;
        }
        self.apply_workspace_chunk(result?).await;
        Ok(())
    }

    async fn apply_workspace_chunk(&self, chunk: Value) {
        if chunk.is_null() {
            return;
        }
        let report: WorkspaceReport = match serde_json::from_value(chunk) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("malformed workspace diagnostic report: {e}");
                return;
            }
        };
        for item in report.items {
            let uri = item.uri;
            // A document pull owns its document.
            if item.report.kind == ReportKind::Full
                && !self.tracker.tracks(PullState::Document, &uri)
            {
                self.publisher.publish(uri.clone(), item.report.items).await;
            }
            self.tracker
                .update(PullState::Workspace, &uri, item.version, item.report.result_id);
        }
    }
}

struct Pulls(Arc<DocumentPuller>);

impl PullRequestor for Pulls {
    fn pull(&self, key: String) -> BoxFuture<'static, PullOutcome> {
        let puller = self.0.clone();
        async move { puller.pull_document(key).await }.boxed()
    }
}

async fn workspace_loop(puller: Arc<DocumentPuller>, cancel: CancellationToken, refresh: Arc<Notify>) {
    let mut errors = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match puller.pull_workspace().await {
            Ok(()) => errors = 0,
            Err(e) if e.is_cancellation() => {
                tracing::debug!("workspace diagnostic pull cancelled");
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(errors, "workspace diagnostic pull failed: {e}");
                if errors >= WORKSPACE_PULL_MAX_ERRORS {
                    tracing::warn!("giving up on workspace diagnostics after {errors} consecutive failures");
                    return;
                }
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = refresh.notified() => {}
            () = tokio::time::sleep(Duration::from_millis(WORKSPACE_PULL_DEBOUNCE_MS)) => {}
        }
    }
}

/// Per-connection pull machinery, created by the first registration.
struct PullSession {
    scheduler: BackgroundScheduler,
    cancel: CancellationToken,
    refresh: Arc<Notify>,
    workspace_loop: Option<JoinHandle<()>>,
}

impl Drop for PullSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.workspace_loop.take() {
            task.abort();
        }
    }
}

pub struct DiagnosticFeature {
    puller: Arc<DocumentPuller>,
    client_selector: Option<DocumentSelector>,
    session: Mutex<Option<PullSession>>,
    /// The document the host last focused.
    active: Mutex<Option<String>>,
}

impl DiagnosticFeature {
    /// Build the feature and subscribe it to document sync events.
    pub(crate) fn new(config: DiagnosticConfig) -> Arc<Self> {
        let ignored = build_ignored(&config.options.ignored);
        let feature = Arc::new(Self {
            puller: Arc::new(DocumentPuller {
                sync: config.sync.clone(),
                handlers: config.handlers,
                publisher: config.publisher,
                options: config.options,
                ignored,
                registrations: Mutex::default(),
                tracker: Arc::new(DocumentPullStateTracker::new()),
                outdated: Mutex::default(),
                open_requests: Mutex::default(),
                epochs: Mutex::default(),
                cancel: Mutex::new(CancellationToken::new()),
                workspace_request: Mutex::default(),
            }),
            client_selector: config.client_selector,
            session: Mutex::default(),
            active: Mutex::default(),
        });
        let weak = Arc::downgrade(&feature);
        config.sync.add_listener(weak);
        feature
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<DocumentPullStateTracker> {
        &self.puller.tracker
    }

    /// URIs queued for a pull, in pull order.
    #[must_use]
    pub fn pending_pulls(&self) -> Vec<String> {
        lock(&self.session)
            .as_ref()
            .map(|s| s.scheduler.pending())
            .unwrap_or_default()
    }

    /// True when no document pull is queued or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_none_or(|s| s.scheduler.is_idle())
    }

    fn schedule(&self, uri: &str) {
        if let Some(session) = lock(&self.session).as_ref() {
            session.scheduler.add(uri);
        }
    }

    fn start_session(&self) -> PullSession {
        let cancel = CancellationToken::new();
        *lock(&self.puller.cancel) = cancel.clone();
        PullSession {
            scheduler: BackgroundScheduler::new(Arc::new(Pulls(self.puller.clone()))),
            cancel,
            refresh: Arc::new(Notify::new()),
            workspace_loop: None,
        }
    }

    /// Drop the pull state of `uri` and its diagnostics.
    fn forget(&self, uri: &str) {
        self.puller.invalidate(uri);
        self.puller.tracker.untrack(PullState::Document, uri);
        lock(&self.puller.outdated).remove(uri);
        self.puller.publisher.forget(uri);
        if let Some(session) = lock(&self.session).as_ref() {
            session.scheduler.remove(uri);
        }
    }

    /// `workspace/diagnostic/refresh`: re-pull every open document and
    /// restart the workspace pull.
    pub(crate) fn refresh(&self) {
        let outdated = lock(&self.puller.outdated).clone();
        for document in self.puller.sync.synced_documents() {
            if !outdated.contains(document.uri()) && self.puller.is_pullable(&document) {
                self.schedule(document.uri());
            }
        }
        if let Some(token) = lock(&self.puller.workspace_request).take() {
            token.cancel();
        }
        if let Some(session) = lock(&self.session).as_ref() {
            session.refresh.notify_one();
        }
    }

    /// Pull newly visible documents and drop the state of hidden ones.
    pub(crate) fn visibility_changed(&self) {
        for document in self.puller.sync.synced_documents() {
            let uri = document.uri();
            let tracked = self.puller.tracker.tracks(PullState::Document, uri);
            if self.puller.is_pullable(&document) {
                if !tracked {
                    self.schedule(uri);
                }
            } else if tracked && !self.puller.sync.workspace().is_visible(uri) {
                tracing::debug!(%uri, "document hidden; dropping its pull state");
                self.forget(uri);
            }
        }
    }

    /// The host focused `uri`.
    ///
    /// With inter-file dependencies, the document losing focus is pulled
    /// again in the background since edits elsewhere may change its results.
    pub(crate) fn focused(&self, uri: &str) {
        let previous = lock(&self.active).replace(uri.to_string());
        if let Some(previous) = previous.filter(|p| p != uri)
            && let Some(document) = self.puller.sync.synced_document(&previous)
            && self.puller.is_pullable(&document)
            && self.puller.has_inter_file_dependencies(&document)
        {
            tracing::trace!(uri = %previous, "queueing background pull for the unfocused document");
            self.schedule(&previous);
        }
        if let Some(session) = lock(&self.session).as_ref() {
            session.scheduler.remove(uri);
        }

        if !self.puller.options.on_focus {
            return;
        }
        let Some(document) = self.puller.sync.synced_document(uri) else {
            return;
        };
        if !self.puller.filtered(&document, PullTrigger::OnFocus)
            && self.puller.is_pullable(&document)
        {
            self.schedule(uri);
        }
    }
}

impl SyncListener for DiagnosticFeature {
    fn did_open(&self, document: &TextDocument) {
        if self.puller.is_pullable(document) {
            self.schedule(document.uri());
        }
    }

    fn did_change(&self, document: &TextDocument) {
        if self.puller.options.on_change
            && !self.puller.filtered(document, PullTrigger::OnType)
            && self.puller.is_pullable(document)
        {
            lock(&self.puller.outdated).remove(document.uri());
            self.schedule(document.uri());
        }
    }

    fn did_save(&self, document: &TextDocument) {
        if self.puller.options.on_save
            && !self.puller.filtered(document, PullTrigger::OnSave)
            && self.puller.is_pullable(document)
        {
            self.schedule(document.uri());
        }
    }

    fn did_close(&self, document: &TextDocument) {
        self.forget(document.uri());
    }
}

impl DynamicFeature for DiagnosticFeature {
    fn registration_type(&self) -> &'static str {
        "textDocument/diagnostic"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        let diagnostic = ensure(capabilities, &["textDocument", "diagnostic"]);
        diagnostic.insert("dynamicRegistration".into(), json!(true));
        diagnostic.insert("relatedDocumentSupport".into(), json!(true));
        ensure(capabilities, &["workspace", "diagnostics"])
            .insert("refreshSupport".into(), json!(true));
    }

    fn initialize(&self, server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if let Some(registration) = static_registration(server_capabilities.get("diagnosticProvider"))
            && let Err(e) = self.register(registration)
        {
            tracing::warn!("diagnostic registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let selector = registration_selector(&registration.register_options, self.client_selector.as_ref())?;
        let options: DiagnosticOptions = serde_json::from_value(registration.register_options)
            .map_err(|e| LspError::Protocol(format!("invalid diagnostic options: {e}")))?;
        let wants_workspace = options.workspace_diagnostics && self.puller.options.workspace;
        lock(&self.puller.registrations).insert(registration.id, selector, options);

        {
            let mut guard = lock(&self.session);
            let session = guard.get_or_insert_with(|| self.start_session());
            if wants_workspace && session.workspace_loop.is_none() {
                session.workspace_loop = Some(tokio::spawn(workspace_loop(
                    self.puller.clone(),
                    session.cancel.clone(),
                    session.refresh.clone(),
                )));
            }
        }

        for document in self.puller.sync.synced_documents() {
            if self.puller.is_pullable(&document)
                && !self.puller.tracker.tracks(PullState::Document, document.uri())
            {
                self.schedule(document.uri());
            }
        }
        Ok(())
    }

    fn unregister(&self, id: &str) {
        let now_empty = {
            let mut registrations = lock(&self.puller.registrations);
            registrations.remove(id);
            registrations.is_empty()
        };
        if now_empty {
            lock(&self.session).take();
        }
    }

    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
        lock(&self.puller.registrations).best(document).map(|r| {
            RegistrationData::new(
                r.id.clone(),
                serde_json::to_value(&r.provider).unwrap_or(Value::Null),
            )
        })
    }

    fn clear(&self) {
        lock(&self.puller.registrations).clear();
        lock(&self.session).take();
        lock(&self.puller.outdated).clear();
        lock(&self.puller.workspace_request).take();
        self.puller.tracker.clear();
    }
}
