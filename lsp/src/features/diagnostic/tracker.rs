//! Per-document pull state: the last pulled version and the server's
//! `resultId`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::lock;

/// Which pull produced a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullState {
    Document,
    Workspace,
}

#[derive(Debug, Default)]
struct Snapshot {
    version: Option<i32>,
    result_id: Option<String>,
}

/// Pull state of one document. Shared by reference; see
/// [`DocumentPullStateTracker::track`].
#[derive(Debug)]
pub struct DocumentPullState {
    uri: String,
    snapshot: Mutex<Snapshot>,
}

impl DocumentPullState {
    fn new(uri: &str, version: Option<i32>, result_id: Option<String>) -> Self {
        Self {
            uri: uri.to_string(),
            snapshot: Mutex::new(Snapshot { version, result_id }),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn version(&self) -> Option<i32> {
        lock(&self.snapshot).version
    }

    #[must_use]
    pub fn result_id(&self) -> Option<String> {
        lock(&self.snapshot).result_id.clone()
    }

    fn set(&self, version: Option<i32>, result_id: Option<String>) {
        let mut snapshot = lock(&self.snapshot);
        snapshot.version = version;
        snapshot.result_id = result_id;
    }
}

/// A `(uri, resultId)` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousResultId {
    pub uri: String,
    pub value: Option<String>,
}

#[derive(Debug, Default)]
pub struct DocumentPullStateTracker {
    document: Mutex<HashMap<String, Arc<DocumentPullState>>>,
    workspace: Mutex<HashMap<String, Arc<DocumentPullState>>>,
}

impl DocumentPullStateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self, kind: PullState) -> &Mutex<HashMap<String, Arc<DocumentPullState>>> {
        match kind {
            PullState::Document => &self.document,
            PullState::Workspace => &self.workspace,
        }
    }

    /// The state for `uri`, created on first use. Repeated calls return the
    /// same object.
    pub fn track(&self, kind: PullState, uri: &str, version: Option<i32>) -> Arc<DocumentPullState> {
        lock(self.states(kind))
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(DocumentPullState::new(uri, version, None)))
            .clone()
    }

    pub fn update(&self, kind: PullState, uri: &str, version: Option<i32>, result_id: Option<String>) {
        let mut states = lock(self.states(kind));
        match states.get(uri) {
            Some(state) => state.set(version, result_id),
            None => {
                states.insert(
                    uri.to_string(),
                    Arc::new(DocumentPullState::new(uri, version, result_id)),
                );
            }
        }
    }

    pub fn untrack(&self, kind: PullState, uri: &str) {
        lock(self.states(kind)).remove(uri);
    }

    #[must_use]
    pub fn tracks(&self, kind: PullState, uri: &str) -> bool {
        lock(self.states(kind)).contains_key(uri)
    }

    /// URIs with a document pull state, sorted.
    #[must_use]
    pub fn tracking_documents(&self) -> Vec<String> {
        let mut uris: Vec<String> = lock(&self.document).keys().cloned().collect();
        uris.sort();
        uris
    }

    #[must_use]
    pub fn result_id(&self, kind: PullState, uri: &str) -> Option<String> {
        lock(self.states(kind)).get(uri).and_then(|s| s.result_id())
    }

    /// One row per tracked document, sorted by URI.
    #[must_use]
    pub fn all_result_ids(&self) -> Vec<PreviousResultId> {
        let mut rows: Vec<PreviousResultId> = lock(&self.document)
            .iter()
            .map(|(uri, state)| PreviousResultId {
                uri: uri.clone(),
                value: state.result_id(),
            })
            .collect();
        rows.sort_by(|a, b| a.uri.cmp(&b.uri));
        rows
    }

    /// `previousResultIds` for a workspace pull: every known result id, with
    /// document pulls taking precedence over workspace pulls.
    #[must_use]
    pub fn workspace_previous_result_ids(&self) -> Vec<Value> {
        let mut merged: HashMap<String, String> = HashMap::new();
        for (uri, state) in lock(&self.workspace).iter() {
            if let Some(id) = state.result_id() {
                merged.insert(uri.clone(), id);
            }
        }
        for row in self.all_result_ids() {
            match row.value {
                Some(id) => {
                    merged.insert(row.uri, id);
                }
                None => {
                    merged.remove(&row.uri);
                }
            }
        }

        let mut rows: Vec<(String, String)> = merged.into_iter().collect();
        rows.sort();
        rows.into_iter()
            .map(|(uri, value)| json!({ "uri": uri, "value": value }))
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.document).clear();
        lock(&self.workspace).clear();
    }
}
