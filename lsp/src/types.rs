//! Public types shared between the client runtime and its host.
//!
//! The host hands the client [`TextDocument`] snapshots and change events,
//! receives [`ClientEvent`]s, and reads [`DiagnosticsSnapshot`]s for display.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Zero-based line and UTF-16 column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// Immutable snapshot of an editor buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    uri: String,
    language_id: String,
    version: i32,
    text: String,
}

impl TextDocument {
    #[must_use]
    pub fn new(
        uri: impl Into<String>,
        language_id: impl Into<String>,
        version: i32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            language_id: language_id.into(),
            version,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text of the whole document, or of `range` when given.
    #[must_use]
    pub fn get_text(&self, range: Option<Range>) -> &str {
        match range {
            None => &self.text,
            Some(range) => {
                let start = self.offset_at(range.start);
                let end = self.offset_at(range.end).max(start);
                &self.text[start..end]
            }
        }
    }

    /// Byte offset of `position`, clamped to the document.
    #[must_use]
    pub fn offset_at(&self, position: Position) -> usize {
        let mut line_start = 0;
        for _ in 0..position.line {
            match self.text[line_start..].find('\n') {
                Some(idx) => line_start += idx + 1,
                None => return self.text.len(),
            }
        }

        let rest = &self.text[line_start..];
        let line_end = rest.find('\n').unwrap_or(rest.len());
        let mut units = 0u32;
        for (idx, ch) in rest[..line_end].char_indices() {
            if units >= position.character {
                return line_start + idx;
            }
            units += ch.len_utf16() as u32;
        }
        line_start + line_end
    }

    /// Apply content changes in order, producing the next version.
    #[must_use]
    pub fn apply_changes(&self, version: i32, changes: &[TextDocumentContentChangeEvent]) -> Self {
        let mut next = Self {
            version,
            ..self.clone()
        };
        for change in changes {
            match change.range {
                None => next.text.clone_from(&change.text),
                Some(range) => {
                    let start = next.offset_at(range.start);
                    let end = next.offset_at(range.end).max(start);
                    next.text.replace_range(start..end, &change.text);
                }
            }
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentContentChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    pub text: String,
}

impl TextDocumentContentChangeEvent {
    #[must_use]
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn incremental(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }
}

/// An edit as reported by the host: the post-edit document and the edits
/// that produced it.
#[derive(Debug, Clone)]
pub struct TextDocumentChangeEvent {
    pub document: TextDocument,
    pub content_changes: Vec<TextDocumentContentChangeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextDocumentSaveReason {
    Manual = 1,
    AfterDelay = 2,
    FocusOut = 3,
}

impl TextDocumentSaveReason {
    #[must_use]
    pub fn as_lsp(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone)]
pub struct WillSaveEvent {
    pub document: TextDocument,
    pub reason: TextDocumentSaveReason,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown LSP enum value {0}")]
pub struct UnknownValue(u64);

/// Severity level for a diagnostic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u64", into = "u64")]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Returns `None` for values outside 1..=4.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

impl TryFrom<u64> for DiagnosticSeverity {
    type Error = UnknownValue;

    fn try_from(value: u64) -> Result<Self, UnknownValue> {
        Self::from_lsp(value).ok_or(UnknownValue(value))
    }
}

impl From<DiagnosticSeverity> for u64 {
    fn from(severity: DiagnosticSeverity) -> Self {
        severity as u64
    }
}

/// A diagnostic as reported by a language server.
///
/// Fields the runtime does not interpret (tags, related information, data)
/// are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    range: Range,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    severity: Option<DiagnosticSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    message: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(range: Range, severity: DiagnosticSeverity, message: impl Into<String>) -> Self {
        Self {
            range,
            severity: Some(severity),
            code: None,
            source: None,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    /// Servers may omit severity; clients treat that as an error.
    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity.unwrap_or(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn code(&self) -> Option<&serde_json::Value> {
        self.code.as_ref()
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Format as `path:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &str) -> String {
        let source = self
            .source
            .as_deref()
            .map(|s| format!("[{s}] "))
            .unwrap_or_default();
        format!(
            "{path}:{}:{}: {}: {source}{}",
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity().label(),
            self.message,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum MessageType {
    Error = 1,
    Warning = 2,
    Info = 3,
    Log = 4,
}

impl TryFrom<u64> for MessageType {
    type Error = UnknownValue;

    fn try_from(value: u64) -> Result<Self, UnknownValue> {
        match value {
            1 => Ok(Self::Error),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Info),
            4 => Ok(Self::Log),
            other => Err(UnknownValue(other)),
        }
    }
}

impl From<MessageType> for u64 {
    fn from(kind: MessageType) -> Self {
        kind as u64
    }
}

/// Lifecycle state of a [`LanguageClient`](crate::LanguageClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Initial,
    Starting,
    StartFailed,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "initial",
            Self::Starting => "starting",
            Self::StartFailed => "start failed",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Event broadcast by a client to its host.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged {
        old: ClientState,
        new: ClientState,
    },
    /// Diagnostics for `uri` replaced; an empty list clears them.
    Diagnostics {
        uri: String,
        items: Vec<Diagnostic>,
    },
    LogMessage {
        kind: MessageType,
        message: String,
    },
    ShowMessage {
        kind: MessageType,
        message: String,
    },
    Progress {
        token: serde_json::Value,
        value: serde_json::Value,
    },
}

/// Immutable snapshot of all diagnostics, suitable for display.
///
/// Counts are computed from `files` on demand.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-document diagnostics, documents with errors first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(String, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status like "E:3 W:5"; empty when there is nothing to show.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
