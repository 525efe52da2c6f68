//! JSON-RPC message shapes and LSP parameter builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{
    Diagnostic, MessageType, TextDocument, TextDocumentContentChangeEvent, TextDocumentSaveReason,
};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;
pub const REQUEST_FAILED: i64 = -32803;
pub const SERVER_CANCELLED: i64 = -32802;
pub const CONTENT_MODIFIED: i64 = -32801;
pub const REQUEST_CANCELLED: i64 = -32800;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    id: i64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: i64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Response to a server-initiated request.
///
/// Built by hand because a successful `result` must be present even when null.
pub(crate) fn response(id: Value, outcome: Result<Value, ResponseError>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
        Err(error) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": error }),
    }
}

/// A classified inbound message.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: i64,
        outcome: Result<Value, ResponseError>,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn parse_incoming(message: Value) -> Option<Incoming> {
    let Value::Object(mut map) = message else {
        return None;
    };
    let id = map.remove("id");
    let method = match map.remove("method") {
        Some(Value::String(method)) => Some(method),
        _ => None,
    };
    let params = map.remove("params");

    match (id, method) {
        (Some(id), None) => {
            // Responses to our requests always carry the numeric ids we issued.
            let id = id.as_i64()?;
            let outcome = match (map.remove("result"), map.remove("error")) {
                (_, Some(error)) => Err(serde_json::from_value(error).unwrap_or_else(|_| {
                    ResponseError::new(INTERNAL_ERROR, "malformed error object")
                })),
                (Some(result), None) => Ok(result),
                (None, None) => return None,
            };
            Some(Incoming::Response { id, outcome })
        }
        (Some(id), Some(method)) => Some(Incoming::Request { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (None, None) => None,
    }
}

// ── Inbound payloads ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Registration {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub register_options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegistrationParams {
    pub registrations: Vec<Registration>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Unregistration {
    pub id: String,
    pub method: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UnregistrationParams {
    /// Spelled this way by the protocol.
    #[serde(alias = "unregistrations")]
    pub unregisterations: Vec<Unregistration>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConfigurationItem {
    #[serde(default)]
    pub scope_uri: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigurationParams {
    pub items: Vec<ConfigurationItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProgressParams {
    pub token: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeResult {
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Key used to route `$/progress` notifications; tokens may be numbers or strings.
pub(crate) fn progress_key(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Outbound parameters ───────────────────────────────────────────────

pub(crate) fn did_open_params(document: &TextDocument) -> Value {
    json!({
        "textDocument": {
            "uri": document.uri(),
            "languageId": document.language_id(),
            "version": document.version(),
            "text": document.text()
        }
    })
}

pub(crate) fn did_change_params(
    document: &TextDocument,
    changes: &[TextDocumentContentChangeEvent],
) -> Value {
    json!({
        "textDocument": {
            "uri": document.uri(),
            "version": document.version()
        },
        "contentChanges": changes
    })
}

pub(crate) fn will_save_params(document: &TextDocument, reason: TextDocumentSaveReason) -> Value {
    json!({
        "textDocument": { "uri": document.uri() },
        "reason": reason.as_lsp()
    })
}

pub(crate) fn did_save_params(document: &TextDocument, include_text: bool) -> Value {
    let mut params = json!({ "textDocument": { "uri": document.uri() } });
    if include_text {
        params["text"] = Value::String(document.text().to_string());
    }
    params
}

pub(crate) fn did_close_params(document: &TextDocument) -> Value {
    json!({ "textDocument": { "uri": document.uri() } })
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
