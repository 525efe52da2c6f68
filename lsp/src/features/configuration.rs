//! Settings exchange: `workspace/configuration` (server pulls) and
//! `workspace/didChangeConfiguration` (client pushes).

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};

use super::{DynamicFeature, RegistrationData, StaticFeature, ensure, new_id};
use crate::connection::ConnectionSlot;
use crate::error::Result;
use crate::lock;
use crate::protocol::ConfigurationParams;
use crate::selector::DocumentSelector;
use crate::types::TextDocument;
use crate::workspace::Workspace;

/// Advertises `workspace.configuration`; requests are answered by the client.
pub struct WorkspaceConfigurationFeature;

impl StaticFeature for WorkspaceConfigurationFeature {
    fn name(&self) -> &'static str {
        "workspace/configuration"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        ensure(capabilities, &["workspace"]).insert("configuration".into(), json!(true));
    }

    fn initialize(&self, _server_capabilities: &Value) {}
}

/// One value per requested item, in request order.
pub(crate) fn configuration_response(workspace: &dyn Workspace, params: &ConfigurationParams) -> Value {
    Value::Array(
        params
            .items
            .iter()
            .map(|item| workspace.configuration(item.section.as_deref(), item.scope_uri.as_deref()))
            .collect(),
    )
}

/// Pushes the configured settings sections to the server.
pub struct DidChangeConfigurationFeature {
    connection: ConnectionSlot,
    workspace: Arc<dyn Workspace>,
    sections: Vec<String>,
    registrations: Mutex<Vec<String>>,
}

impl DidChangeConfigurationFeature {
    pub(crate) fn new(connection: ConnectionSlot, workspace: Arc<dyn Workspace>, sections: Vec<String>) -> Self {
        Self {
            connection,
            workspace,
            sections,
            registrations: Mutex::default(),
        }
    }

    /// `settings` nested by section path, e.g. `xml.format` lands at
    /// `{"xml": {"format": ...}}`.
    #[must_use]
    pub fn settings(&self) -> Value {
        let mut settings = Value::Object(Map::new());
        for section in &self.sections {
            let value = self.workspace.configuration(Some(section), None);
            let mut path: Vec<&str> = section.split('.').collect();
            let Some(leaf) = path.pop() else {
                continue;
            };
            ensure(&mut settings, &path).insert(leaf.to_string(), value);
        }
        settings
    }

    /// Send `workspace/didChangeConfiguration`. Does nothing when no section
    /// is synchronized.
    pub fn send(&self) -> Result<()> {
        if self.sections.is_empty() {
            return Ok(());
        }
        tracing::debug!(sections = ?self.sections, "sending configuration");
        self.connection.notify(
            "workspace/didChangeConfiguration",
            Some(json!({ "settings": self.settings() })),
        )
    }
}

impl DynamicFeature for DidChangeConfigurationFeature {
    fn registration_type(&self) -> &'static str {
        "workspace/didChangeConfiguration"
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        ensure(capabilities, &["workspace", "didChangeConfiguration"])
            .insert("dynamicRegistration".into(), json!(true));
    }

    fn initialize(&self, _server_capabilities: &Value, _selector: Option<&DocumentSelector>) {
        if !self.sections.is_empty()
            && let Err(e) = self.register(RegistrationData::new(new_id(), json!({ "section": self.sections })))
        {
            tracing::warn!("configuration registration failed: {e}");
        }
    }

    fn register(&self, registration: RegistrationData) -> Result<()> {
        let mut registrations = lock(&self.registrations);
        if !registrations.contains(&registration.id) {
            registrations.push(registration.id);
        }
        Ok(())
    }

    fn unregister(&self, id: &str) {
        lock(&self.registrations).retain(|r| r != id);
    }

    /// Not document scoped.
    fn get_provider(&self, _document: &TextDocument) -> Option<RegistrationData> {
        None
    }

    fn clear(&self) {
        lock(&self.registrations).clear();
    }
}
