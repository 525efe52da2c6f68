//! Capabilities the client implements itself rather than per document.

use serde_json::{Value, json};

use super::{StaticFeature, ensure};

/// `window/*`: progress, messages and message requests.
pub struct WindowFeature;

impl StaticFeature for WindowFeature {
    fn name(&self) -> &'static str {
        "window/workDoneProgress"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        let window = ensure(capabilities, &["window"]);
        window.insert("workDoneProgress".into(), json!(true));
        window.insert(
            "showMessage".into(),
            json!({ "messageActionItem": { "additionalPropertiesSupport": false } }),
        );
    }

    fn initialize(&self, _server_capabilities: &Value) {}
}

/// `textDocument/publishDiagnostics`, the push model.
pub struct PublishDiagnosticsFeature;

impl StaticFeature for PublishDiagnosticsFeature {
    fn name(&self) -> &'static str {
        "textDocument/publishDiagnostics"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        let publish = ensure(capabilities, &["textDocument", "publishDiagnostics"]);
        publish.insert("relatedInformation".into(), json!(true));
        publish.insert("versionSupport".into(), json!(false));
        publish.insert("tagSupport".into(), json!({ "valueSet": [1, 2] }));
    }

    fn initialize(&self, _server_capabilities: &Value) {}
}

/// `workspace/workspaceFolders`.
pub struct WorkspaceFoldersFeature;

impl StaticFeature for WorkspaceFoldersFeature {
    fn name(&self) -> &'static str {
        "workspace/workspaceFolders"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        ensure(capabilities, &["workspace"]).insert("workspaceFolders".into(), json!(true));
    }

    fn initialize(&self, server_capabilities: &Value) {
        let supported = server_capabilities
            .pointer("/workspace/workspaceFolders/supported")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        tracing::debug!(supported, "server workspace folder support");
    }
}
