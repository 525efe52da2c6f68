//! Features turn capabilities into live protocol behavior.
//!
//! A [`StaticFeature`] contributes client capabilities and reads the server
//! capabilities once. A [`DynamicFeature`] additionally accepts registrations,
//! either derived from the `initialize` result or sent later through
//! `client/registerCapability`, and resolves the best registration for a
//! document.

pub mod configuration;
pub mod diagnostic;
pub mod general;
pub mod sync;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::{Map, Value};

use crate::error::{LspError, Result};
use crate::lock;
use crate::protocol::{REQUEST_FAILED, RegistrationParams, ResponseError, UnregistrationParams};
use crate::selector::{self, DocumentSelector};
use crate::types::TextDocument;

/// A registration as handed to [`DynamicFeature::register`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationData {
    pub id: String,
    pub register_options: Value,
}

impl RegistrationData {
    #[must_use]
    pub fn new(id: impl Into<String>, register_options: Value) -> Self {
        Self {
            id: id.into(),
            register_options,
        }
    }
}

pub trait StaticFeature: Send + Sync {
    /// Key matched against `disabled_features`.
    fn name(&self) -> &'static str;

    fn fill_client_capabilities(&self, capabilities: &mut Value);

    fn initialize(&self, server_capabilities: &Value);

    fn clear(&self) {}
}

pub trait DynamicFeature: Send + Sync {
    /// The protocol method registrations for this feature carry.
    fn registration_type(&self) -> &'static str;

    fn fill_client_capabilities(&self, capabilities: &mut Value);

    /// Register whatever the server declared statically.
    fn initialize(&self, server_capabilities: &Value, document_selector: Option<&DocumentSelector>);

    /// Store `registration`; an existing registration with the same id is
    /// replaced.
    fn register(&self, registration: RegistrationData) -> Result<()>;

    /// Drop the registration `id`. Unknown ids are ignored.
    fn unregister(&self, id: &str);

    /// The best-matching registration for `document`, if any.
    fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData>;

    fn clear(&self);
}

#[derive(Clone)]
pub enum Feature {
    Static(Arc<dyn StaticFeature>),
    Dynamic(Arc<dyn DynamicFeature>),
}

impl Feature {
    fn key(&self) -> &'static str {
        match self {
            Self::Static(feature) => feature.name(),
            Self::Dynamic(feature) => feature.registration_type(),
        }
    }

    fn fill_client_capabilities(&self, capabilities: &mut Value) {
        match self {
            Self::Static(feature) => feature.fill_client_capabilities(capabilities),
            Self::Dynamic(feature) => feature.fill_client_capabilities(capabilities),
        }
    }

    fn clear(&self) {
        match self {
            Self::Static(feature) => feature.clear(),
            Self::Dynamic(feature) => feature.clear(),
        }
    }
}

/// All features of one client, in registration order.
pub struct FeatureRegistry {
    features: Mutex<Vec<Feature>>,
    disabled: HashSet<String>,
}

impl FeatureRegistry {
    #[must_use]
    pub fn new(disabled: HashSet<String>) -> Self {
        Self {
            features: Mutex::new(Vec::new()),
            disabled,
        }
    }

    pub fn register_feature(&self, feature: Feature) {
        lock(&self.features).push(feature);
    }

    /// The dynamic feature handling `method`.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<Arc<dyn DynamicFeature>> {
        lock(&self.features).iter().find_map(|feature| match feature {
            Feature::Dynamic(dynamic) if dynamic.registration_type() == method => {
                Some(dynamic.clone())
            }
            _ => None,
        })
    }

    #[must_use]
    pub fn is_disabled(&self, method: &str) -> bool {
        self.disabled.contains(method)
    }

    fn enabled(&self) -> Vec<Feature> {
        lock(&self.features)
            .iter()
            .filter(|feature| !self.disabled.contains(feature.key()))
            .cloned()
            .collect()
    }

    /// Aggregate client capabilities; disabled features contribute nothing.
    pub fn fill_client_capabilities(&self, capabilities: &mut Value) {
        for feature in self.enabled() {
            feature.fill_client_capabilities(capabilities);
        }
    }

    pub fn initialize(&self, server_capabilities: &Value, document_selector: Option<&DocumentSelector>) {
        for feature in self.enabled() {
            match feature {
                Feature::Static(feature) => feature.initialize(server_capabilities),
                Feature::Dynamic(feature) => {
                    feature.initialize(server_capabilities, document_selector);
                }
            }
        }
    }

    /// Handle `client/registerCapability`.
    pub(crate) fn handle_register(&self, params: RegistrationParams) -> Result<(), ResponseError> {
        let mut failures = Vec::new();
        for registration in params.registrations {
            if self.is_disabled(&registration.method) {
                tracing::debug!(method = %registration.method, "ignoring registration for disabled feature");
                continue;
            }
            let Some(feature) = self.get(&registration.method) else {
                failures.push(format!(
                    "No feature implementation for {} found. Registration failed.",
                    registration.method
                ));
                continue;
            };
            let data = RegistrationData::new(
                registration.id,
                registration
                    .register_options
                    .unwrap_or_else(|| Value::Object(Map::new())),
            );
            tracing::debug!(method = %registration.method, id = %data.id, "registering capability");
            if let Err(e) = feature.register(data) {
                failures.push(format!("Registration of {} failed: {e}", registration.method));
            }
        }
        into_response(failures)
    }

    /// Handle `client/unregisterCapability`.
    pub(crate) fn handle_unregister(&self, params: UnregistrationParams) -> Result<(), ResponseError> {
        let mut failures = Vec::new();
        for unregistration in params.unregisterations {
            if self.is_disabled(&unregistration.method) {
                continue;
            }
            match self.get(&unregistration.method) {
                Some(feature) => {
                    tracing::debug!(method = %unregistration.method, id = %unregistration.id, "unregistering capability");
                    feature.unregister(&unregistration.id);
                }
                None => failures.push(format!(
                    "No feature implementation for {} found. Unregistration failed.",
                    unregistration.method
                )),
            }
        }
        into_response(failures)
    }

    /// Drop every registration and per-connection state.
    pub fn clear(&self) {
        let features: Vec<Feature> = lock(&self.features).clone();
        for feature in features {
            feature.clear();
        }
    }
}

fn into_response(failures: Vec<String>) -> Result<(), ResponseError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ResponseError::new(REQUEST_FAILED, failures.join("; ")))
    }
}

/// One stored registration.
#[derive(Debug, Clone)]
pub(crate) struct Registration<P> {
    pub id: String,
    pub selector: Option<DocumentSelector>,
    pub provider: P,
}

/// Registrations of one feature, in insertion order, keyed by id.
#[derive(Debug)]
pub(crate) struct Registrations<P> {
    entries: Vec<Registration<P>>,
}

impl<P> Default for Registrations<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P: Clone> Registrations<P> {
    /// Insert or replace in place; replacing keeps the original position.
    pub fn insert(&mut self, id: String, selector: Option<DocumentSelector>, provider: P) {
        let registration = Registration {
            id,
            selector,
            provider,
        };
        match self.entries.iter_mut().find(|r| r.id == registration.id) {
            Some(existing) => *existing = registration,
            None => self.entries.push(registration),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Registration<P>> {
        let index = self.entries.iter().position(|r| r.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Highest-scoring registration; the earliest wins ties.
    pub fn best(&self, document: &TextDocument) -> Option<&Registration<P>> {
        let mut best: Option<(u32, &Registration<P>)> = None;
        for registration in &self.entries {
            let score = selector::score(registration.selector.as_ref(), document);
            if score > 0 && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, registration));
            }
        }
        best.map(|(_, registration)| registration)
    }

    pub fn matches(&self, document: &TextDocument) -> bool {
        self.best(document).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration<P>> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Registration derived from a `{method}Provider` server capability.
///
/// `true` and option objects register; `false` and absent do not.
pub(crate) fn static_registration(capability: Option<&Value>) -> Option<RegistrationData> {
    match capability? {
        Value::Bool(true) => Some(RegistrationData::new(new_id(), Value::Object(Map::new()))),
        Value::Object(options) => {
            let id = options
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(new_id, str::to_string);
            Some(RegistrationData::new(id, Value::Object(options.clone())))
        }
        _ => None,
    }
}

/// The selector a registration applies to.
///
/// A missing or null `documentSelector` falls back to the client selector.
pub(crate) fn registration_selector(
    register_options: &Value,
    client_selector: Option<&DocumentSelector>,
) -> Result<Option<DocumentSelector>> {
    let selector = DocumentSelector::from_options(register_options)
        .map_err(|e| LspError::Protocol(format!("invalid documentSelector: {e}")))?;
    Ok(selector.or_else(|| client_selector.cloned()))
}

/// Compile path globs, skipping invalid ones.
pub(crate) fn build_ignored(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => tracing::warn!(%pattern, "skipping invalid ignore glob: {e}"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("ignore globs disabled: {e}");
        GlobSet::empty()
    })
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The object at `path` below `root`, created as needed.
pub(crate) fn ensure<'a>(root: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    let mut current = root;
    for key in path {
        current = object_mut(current)
            .entry(*key)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    object_mut(current)
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let Value::Object(map) = value else {
        unreachable!("value was just replaced by an object");
    };
    map
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::{Registration as WireRegistration, Unregistration};

    #[derive(Default)]
    struct RecordingFeature {
        registrations: Mutex<Registrations<Value>>,
    }

    impl DynamicFeature for RecordingFeature {
        fn registration_type(&self) -> &'static str {
            "textDocument/test"
        }

        fn fill_client_capabilities(&self, capabilities: &mut Value) {
            ensure(capabilities, &["textDocument", "test"])
                .insert("dynamicRegistration".into(), json!(true));
        }

        fn initialize(&self, caps: &Value, selector: Option<&DocumentSelector>) {
            if let Some(data) = static_registration(caps.get("testProvider")) {
                let selector = registration_selector(&data.register_options, selector).unwrap();
                lock(&self.registrations).insert(data.id, selector, data.register_options);
            }
        }

        fn register(&self, data: RegistrationData) -> Result<()> {
            let selector = registration_selector(&data.register_options, None)?;
            lock(&self.registrations).insert(data.id, selector, data.register_options);
            Ok(())
        }

        fn unregister(&self, id: &str) {
            lock(&self.registrations).remove(id);
        }

        fn get_provider(&self, document: &TextDocument) -> Option<RegistrationData> {
            lock(&self.registrations)
                .best(document)
                .map(|r| RegistrationData::new(r.id.clone(), r.provider.clone()))
        }

        fn clear(&self) {
            lock(&self.registrations).clear();
        }
    }

    fn xml() -> TextDocument {
        TextDocument::new("file:///a.xml", "xml", 1, "")
    }

    fn register_params(id: &str, method: &str, options: Value) -> RegistrationParams {
        RegistrationParams {
            registrations: vec![WireRegistration {
                id: id.to_string(),
                method: method.to_string(),
                register_options: Some(options),
            }],
        }
    }

    #[test]
    fn ensure_builds_nested_objects() {
        let mut caps = json!({ "textDocument": { "hover": {} } });
        ensure(&mut caps, &["textDocument", "diagnostic"]).insert("x".into(), json!(1));
        ensure(&mut caps, &["workspace"]).insert("y".into(), json!(2));
        assert_eq!(caps["textDocument"]["diagnostic"]["x"], 1);
        assert!(caps["textDocument"]["hover"].is_object());
        assert_eq!(caps["workspace"]["y"], 2);
    }

    #[test]
    fn same_id_replaces_in_place() {
        let mut registrations = Registrations::default();
        registrations.insert("a".into(), None, 1);
        registrations.insert("b".into(), None, 2);
        registrations.insert("a".into(), None, 3);
        assert_eq!(registrations.len(), 2);
        assert_eq!(registrations.best(&xml()).unwrap().provider, 3);
        assert!(registrations.remove("missing").is_none());
    }

    #[test]
    fn best_prefers_higher_score_then_earliest() {
        let mut registrations = Registrations::default();
        let by_pattern: DocumentSelector = serde_json::from_value(json!([{ "pattern": "**/*.xml" }])).unwrap();
        let by_language: DocumentSelector = serde_json::from_value(json!([{ "language": "xml" }])).unwrap();
        let other: DocumentSelector = serde_json::from_value(json!([{ "language": "json" }])).unwrap();
        registrations.insert("pattern".into(), Some(by_pattern), "p");
        registrations.insert("language".into(), Some(by_language.clone()), "l");
        registrations.insert("language-2".into(), Some(by_language), "l2");
        registrations.insert("other".into(), Some(other), "o");

        assert_eq!(registrations.best(&xml()).unwrap().id, "language");
        registrations.remove("language");
        assert_eq!(registrations.best(&xml()).unwrap().id, "language-2");

        let json_doc = TextDocument::new("file:///a.json", "json", 1, "");
        assert_eq!(registrations.best(&json_doc).unwrap().id, "other");
        let rust_doc = TextDocument::new("file:///a.rs", "rust", 1, "");
        assert!(registrations.best(&rust_doc).is_none());
    }

    #[test]
    fn static_registration_shapes() {
        assert!(static_registration(None).is_none());
        assert!(static_registration(Some(&json!(false))).is_none());
        assert!(static_registration(Some(&json!(true))).is_some());
        let with_id = static_registration(Some(&json!({ "id": "fixed", "identifier": "x" }))).unwrap();
        assert_eq!(with_id.id, "fixed");
        assert_eq!(with_id.register_options["identifier"], "x");
    }

    #[test]
    fn null_selector_falls_back_to_client_selector() {
        let client: DocumentSelector = serde_json::from_value(json!(["xml"])).unwrap();
        let resolved = registration_selector(&json!({ "documentSelector": null }), Some(&client))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.filters()[0].language(), Some("xml"));

        let explicit = registration_selector(&json!({ "documentSelector": ["json"] }), Some(&client))
            .unwrap()
            .unwrap();
        assert_eq!(explicit.filters()[0].language(), Some("json"));
        assert!(registration_selector(&json!({ "documentSelector": 5 }), None).is_err());
    }

    #[test]
    fn registry_routes_registrations_by_method() {
        let registry = FeatureRegistry::new(HashSet::new());
        let feature = Arc::new(RecordingFeature::default());
        registry.register_feature(Feature::Dynamic(feature.clone()));

        registry
            .handle_register(register_params(
                "r1",
                "textDocument/test",
                json!({ "documentSelector": [{ "language": "xml" }] }),
            ))
            .unwrap();
        assert_eq!(registry.get("textDocument/test").unwrap().get_provider(&xml()).unwrap().id, "r1");

        let unknown = registry
            .handle_register(register_params("r2", "textDocument/unknown", json!({})))
            .unwrap_err();
        assert!(unknown.message.contains("textDocument/unknown"));

        registry
            .handle_unregister(UnregistrationParams {
                unregisterations: vec![Unregistration {
                    id: "r1".into(),
                    method: "textDocument/test".into(),
                }],
            })
            .unwrap();
        assert!(feature.get_provider(&xml()).is_none());
    }

    #[test]
    fn disabled_features_advertise_nothing_and_ignore_registrations() {
        let registry = FeatureRegistry::new(HashSet::from(["textDocument/test".to_string()]));
        let feature = Arc::new(RecordingFeature::default());
        registry.register_feature(Feature::Dynamic(feature.clone()));

        let mut caps = json!({});
        registry.fill_client_capabilities(&mut caps);
        assert!(caps.get("textDocument").is_none());

        registry.initialize(&json!({ "testProvider": true }), None);
        registry
            .handle_register(register_params("r1", "textDocument/test", json!({})))
            .unwrap();
        assert!(feature.get_provider(&xml()).is_none());
    }

    #[test]
    fn static_capability_registers_on_initialize_and_clear_drops_it() {
        let registry = FeatureRegistry::new(HashSet::new());
        let feature = Arc::new(RecordingFeature::default());
        registry.register_feature(Feature::Dynamic(feature.clone()));

        registry.initialize(&json!({ "testProvider": true }), None);
        assert!(feature.get_provider(&xml()).is_some());
        registry.clear();
        assert!(feature.get_provider(&xml()).is_none());
    }
}
