//! The host side of the client: open documents, visibility and settings.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::lock;
use crate::types::TextDocument;

/// What the client may ask its host about.
pub trait Workspace: Send + Sync {
    /// Every document the host currently has open.
    fn text_documents(&self) -> Vec<TextDocument>;

    fn document(&self, uri: &str) -> Option<TextDocument> {
        self.text_documents().into_iter().find(|d| d.uri() == uri)
    }

    /// Whether the document is shown in some editor tab.
    fn is_visible(&self, _uri: &str) -> bool {
        true
    }

    /// Settings below `section` (dotted), or all settings when `None`.
    fn configuration(&self, _section: Option<&str>, _scope_uri: Option<&str>) -> Value {
        Value::Null
    }

    fn root_path(&self) -> Option<PathBuf> {
        None
    }

    fn workspace_folders(&self) -> Vec<PathBuf> {
        self.root_path().into_iter().collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<String, TextDocument>,
    hidden: HashSet<String>,
    settings: Value,
}

/// An in-memory [`Workspace`] for tools and tests.
#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    root: Option<PathBuf>,
    state: Mutex<MemoryState>,
}

impl MemoryWorkspace {
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            state: Mutex::default(),
        }
    }

    pub fn open(&self, document: TextDocument) {
        lock(&self.state)
            .documents
            .insert(document.uri().to_string(), document);
    }

    /// Replace the stored copy of an open document.
    pub fn update(&self, document: TextDocument) {
        self.open(document);
    }

    pub fn close(&self, uri: &str) -> Option<TextDocument> {
        let mut state = lock(&self.state);
        state.hidden.remove(uri);
        state.documents.remove(uri)
    }

    pub fn hide(&self, uri: &str) {
        lock(&self.state).hidden.insert(uri.to_string());
    }

    pub fn show(&self, uri: &str) {
        lock(&self.state).hidden.remove(uri);
    }

    pub fn set_settings(&self, settings: Value) {
        lock(&self.state).settings = settings;
    }
}

impl Workspace for MemoryWorkspace {
    fn text_documents(&self) -> Vec<TextDocument> {
        let state = lock(&self.state);
        let mut documents: Vec<TextDocument> = state.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.uri().cmp(b.uri()));
        documents
    }

    fn document(&self, uri: &str) -> Option<TextDocument> {
        lock(&self.state).documents.get(uri).cloned()
    }

    fn is_visible(&self, uri: &str) -> bool {
        let state = lock(&self.state);
        state.documents.contains_key(uri) && !state.hidden.contains(uri)
    }

    fn configuration(&self, section: Option<&str>, _scope_uri: Option<&str>) -> Value {
        let state = lock(&self.state);
        let Some(section) = section else {
            return state.settings.clone();
        };
        section
            .split('.')
            .try_fold(&state.settings, |value, key| value.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}
