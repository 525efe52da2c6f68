//! Diagnostics collection shared by push and pull sources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::broadcast;

use crate::lock;
use crate::middleware::{self, DiagnosticsEvent, Middleware, Next};
use crate::types::{ClientEvent, Diagnostic, DiagnosticsSnapshot};

/// Per-document diagnostics keyed by URI.
///
/// Cloning yields another handle to the same collection.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticCollection {
    data: Arc<Mutex<HashMap<String, Vec<Diagnostic>>>>,
}

impl DiagnosticCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the diagnostics of `uri`; an empty list removes the entry.
    pub fn set(&self, uri: &str, items: Vec<Diagnostic>) {
        let mut data = lock(&self.data);
        if items.is_empty() {
            data.remove(uri);
        } else {
            data.insert(uri.to_string(), items);
        }
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        lock(&self.data).get(uri).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn has(&self, uri: &str) -> bool {
        lock(&self.data).contains_key(uri)
    }

    pub fn delete(&self, uri: &str) {
        lock(&self.data).remove(uri);
    }

    pub fn clear(&self) {
        lock(&self.data).clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.data).is_empty()
    }

    /// Documents with errors first, then by URI.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<Diagnostic>)> = lock(&self.data)
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }

    /// Error-level diagnostics for the given documents, skipping clean ones.
    #[must_use]
    pub fn errors_for(&self, uris: &[String]) -> Vec<(String, Vec<Diagnostic>)> {
        let data = lock(&self.data);
        uris.iter()
            .filter_map(|uri| {
                let errors: Vec<Diagnostic> = data
                    .get(uri)?
                    .iter()
                    .filter(|d| d.severity().is_error())
                    .cloned()
                    .collect();
                (!errors.is_empty()).then(|| (uri.clone(), errors))
            })
            .collect()
    }
}

/// Writes diagnostics into the collection through the user middleware and
/// tells the host.
#[derive(Clone)]
pub(crate) struct DiagnosticPublisher {
    collection: DiagnosticCollection,
    events: broadcast::Sender<ClientEvent>,
    middleware: Middleware,
}

impl DiagnosticPublisher {
    pub fn new(
        collection: DiagnosticCollection,
        events: broadcast::Sender<ClientEvent>,
        middleware: Middleware,
    ) -> Self {
        Self {
            collection,
            events,
            middleware,
        }
    }

    pub async fn publish(&self, uri: String, diagnostics: Vec<Diagnostic>) {
        let collection = self.collection.clone();
        let events = self.events.clone();
        let next: Next<DiagnosticsEvent> = Box::new(move |event: DiagnosticsEvent| {
            async move {
                tracing::debug!(uri = %event.uri, count = event.diagnostics.len(), "diagnostics updated");
                collection.set(&event.uri, event.diagnostics.clone());
                let _ = events.send(ClientEvent::Diagnostics {
                    uri: event.uri,
                    items: event.diagnostics,
                });
                Ok(())
            }
            .boxed()
        });

        let event = DiagnosticsEvent { uri, diagnostics };
        if let Err(e) =
            middleware::run(self.middleware.handle_diagnostics_hook(), event, next).await
        {
            tracing::warn!("diagnostics middleware failed: {e}");
        }
    }

    /// Drop the diagnostics of a document the client no longer tracks.
    pub fn forget(&self, uri: &str) {
        if self.collection.has(uri) {
            self.collection.delete(uri);
            let _ = self.events.send(ClientEvent::Diagnostics {
                uri: uri.to_string(),
                items: Vec::new(),
            });
        }
    }
}
