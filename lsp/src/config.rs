//! Client options, loadable from TOML.
//!
//! ```toml
//! name = "xml"
//! document_selector = [{ language = "xml" }]
//! ignored_documents = ["**/generated/**"]
//!
//! [server]
//! command = "lemminx"
//! transport = "stdio"
//!
//! [diagnostic_pull]
//! on_save = true
//! ignored = ["**/target/**"]
//!
//! [connection]
//! max_restart_count = 4
//! ```
//!
//! Hooks that cannot be expressed in TOML (middleware, handlers, filters and
//! the workspace host) are attached in code with the `with_*` builders.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use globset::Glob;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::middleware::Middleware;
use crate::policy::{
    DEFAULT_MAX_RESTART_COUNT, DEFAULT_RESTART_WINDOW, ErrorHandler, InitializationFailedHandler,
};
use crate::selector::DocumentSelector;
use crate::transport::{Executable, NodeModule, ServerOptions, TransportKind};
use crate::types::TextDocument;
use crate::workspace::Workspace;

pub const DEFAULT_WILL_SAVE_WAIT_UNTIL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Why a document pull is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullTrigger {
    OnType,
    OnSave,
    OnFocus,
}

/// Returns `true` to skip pulling `document` for this trigger.
pub type PullFilter = Arc<dyn Fn(&TextDocument, PullTrigger) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct DiagnosticPullOptions {
    /// Pull after every content change of a tracked document.
    pub on_change: bool,
    pub on_save: bool,
    /// Re-pull the document that becomes active.
    pub on_focus: bool,
    /// Run the workspace pull loop when the server supports it.
    pub workspace: bool,
    /// Globs over file paths that are never pulled.
    pub ignored: Vec<String>,
    pub filter: Option<PullFilter>,
}

impl Default for DiagnosticPullOptions {
    fn default() -> Self {
        Self {
            on_change: true,
            on_save: false,
            on_focus: false,
            workspace: true,
            ignored: Vec::new(),
            filter: None,
        }
    }
}

impl fmt::Debug for DiagnosticPullOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticPullOptions")
            .field("on_change", &self.on_change)
            .field("on_save", &self.on_save)
            .field("on_focus", &self.on_focus)
            .field("workspace", &self.workspace)
            .field("ignored", &self.ignored)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Everything a [`LanguageClient`](crate::LanguageClient) is built from.
#[derive(Clone, Deserialize)]
#[serde(try_from = "RawClientOptions")]
pub struct ClientOptions {
    pub name: String,
    pub server: ServerOptions,
    /// Documents the client cares about; `None` means all.
    pub document_selector: Option<DocumentSelector>,
    /// Path globs of documents never synced, whatever the server registers.
    pub ignored_documents: Vec<String>,
    /// Settings sections pushed with `workspace/didChangeConfiguration`.
    pub configuration_section: Vec<String>,
    pub initialization_options: Option<Value>,
    pub diagnostic_pull: DiagnosticPullOptions,
    /// Registration methods whose capabilities are never advertised.
    pub disabled_features: HashSet<String>,
    pub max_restart_count: usize,
    pub restart_window: Duration,
    pub will_save_wait_until_timeout: Duration,
    /// Hold `didOpen` until the document becomes visible.
    pub delay_open_notifications: bool,
    pub initialization_retries: u32,
    pub middleware: Middleware,
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    pub initialization_failed_handler: Option<InitializationFailedHandler>,
    pub workspace: Option<Arc<dyn Workspace>>,
}

impl ClientOptions {
    #[must_use]
    pub fn new(name: impl Into<String>, server: ServerOptions) -> Self {
        Self {
            name: name.into(),
            server,
            document_selector: None,
            ignored_documents: Vec::new(),
            configuration_section: Vec::new(),
            initialization_options: None,
            diagnostic_pull: DiagnosticPullOptions::default(),
            disabled_features: HashSet::new(),
            max_restart_count: DEFAULT_MAX_RESTART_COUNT,
            restart_window: DEFAULT_RESTART_WINDOW,
            will_save_wait_until_timeout: DEFAULT_WILL_SAVE_WAIT_UNTIL_TIMEOUT,
            delay_open_notifications: false,
            initialization_retries: 0,
            middleware: Middleware::default(),
            error_handler: None,
            initialization_failed_handler: None,
            workspace: None,
        }
    }

    /// Read and parse a TOML file.
    ///
    /// Relative `cwd` and `module` paths resolve against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let mut options = Self::from_toml_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Some(base) = path.parent() {
            options.resolve_relative_paths(base);
        }
        Ok(options)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        match &mut self.server {
            ServerOptions::Executable(exe) => {
                if let Some(cwd) = exe.cwd.as_mut() {
                    resolve(cwd);
                }
            }
            ServerOptions::Module(module) => {
                resolve(&mut module.module);
                if let Some(cwd) = module.cwd.as_mut() {
                    resolve(cwd);
                }
            }
            ServerOptions::Tcp { .. } | ServerOptions::Factory(_) => {}
        }
    }

    #[must_use]
    pub fn with_document_selector(mut self, selector: DocumentSelector) -> Self {
        self.document_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware = middleware;
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_initialization_failed_handler(
        mut self,
        handler: InitializationFailedHandler,
    ) -> Self {
        self.initialization_failed_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    #[must_use]
    pub fn with_diagnostic_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TextDocument, PullTrigger) -> bool + Send + Sync + 'static,
    {
        self.diagnostic_pull.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn is_disabled(&self, method: &str) -> bool {
        self.disabled_features.contains(method)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("document_selector", &self.document_selector)
            .field("ignored_documents", &self.ignored_documents)
            .field("configuration_section", &self.configuration_section)
            .field("diagnostic_pull", &self.diagnostic_pull)
            .field("disabled_features", &self.disabled_features)
            .field("max_restart_count", &self.max_restart_count)
            .field("restart_window", &self.restart_window)
            .field("delay_open_notifications", &self.delay_open_notifications)
            .field("initialization_retries", &self.initialization_retries)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

// ── Raw TOML shape ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawTransport {
    Stdio,
    Ipc,
    Pipe,
    Socket,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    command: Option<String>,
    module: Option<PathBuf>,
    runtime: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    transport: Option<RawTransport>,
    port: Option<u16>,
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSections {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct RawSynchronize {
    configuration_section: Option<RawSections>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawDiagnosticPull {
    on_change: bool,
    on_save: bool,
    on_focus: bool,
    workspace: bool,
    ignored: Vec<String>,
}

impl Default for RawDiagnosticPull {
    fn default() -> Self {
        let defaults = DiagnosticPullOptions::default();
        Self {
            on_change: defaults.on_change,
            on_save: defaults.on_save,
            on_focus: defaults.on_focus,
            workspace: defaults.workspace,
            ignored: defaults.ignored,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConnection {
    max_restart_count: Option<usize>,
    restart_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawClientOptions {
    name: Option<String>,
    server: RawServer,
    document_selector: Option<DocumentSelector>,
    #[serde(default)]
    ignored_documents: Vec<String>,
    #[serde(default)]
    synchronize: RawSynchronize,
    initialization_options: Option<Value>,
    #[serde(default)]
    diagnostic_pull: RawDiagnosticPull,
    #[serde(default)]
    disabled_features: Vec<String>,
    #[serde(default)]
    connection: RawConnection,
    will_save_wait_until_timeout_ms: Option<u64>,
    #[serde(default)]
    delay_open_notifications: bool,
    #[serde(default)]
    initialization_retries: u32,
}

impl TryFrom<RawClientOptions> for ClientOptions {
    type Error = ConfigError;

    fn try_from(raw: RawClientOptions) -> Result<Self, Self::Error> {
        let (default_name, server) = resolve_server(raw.server)?;

        for pattern in raw.diagnostic_pull.ignored.iter().chain(&raw.ignored_documents) {
            Glob::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("invalid ignored glob `{pattern}`: {e}"))
            })?;
        }

        let configuration_section = match raw.synchronize.configuration_section {
            None => Vec::new(),
            Some(RawSections::One(section)) => vec![section],
            Some(RawSections::Many(sections)) => sections,
        };

        let mut options = Self::new(raw.name.unwrap_or(default_name), server);
        options.document_selector = raw.document_selector;
        options.ignored_documents = raw.ignored_documents;
        options.configuration_section = configuration_section;
        options.initialization_options = raw.initialization_options;
        options.diagnostic_pull = DiagnosticPullOptions {
            on_change: raw.diagnostic_pull.on_change,
            on_save: raw.diagnostic_pull.on_save,
            on_focus: raw.diagnostic_pull.on_focus,
            workspace: raw.diagnostic_pull.workspace,
            ignored: raw.diagnostic_pull.ignored,
            filter: None,
        };
        options.disabled_features = raw.disabled_features.into_iter().collect();
        if let Some(count) = raw.connection.max_restart_count {
            options.max_restart_count = count;
        }
        if let Some(secs) = raw.connection.restart_window_secs {
            options.restart_window = Duration::from_secs(secs);
        }
        if let Some(ms) = raw.will_save_wait_until_timeout_ms {
            options.will_save_wait_until_timeout = Duration::from_millis(ms);
        }
        options.delay_open_notifications = raw.delay_open_notifications;
        options.initialization_retries = raw.initialization_retries;
        Ok(options)
    }
}

/// Pick the launch mode and a default client name from `[server]`.
fn resolve_server(raw: RawServer) -> Result<(String, ServerOptions), ConfigError> {
    let transport = match raw.transport {
        None => None,
        Some(RawTransport::Stdio) => Some(TransportKind::Stdio),
        Some(RawTransport::Ipc) => Some(TransportKind::Ipc),
        Some(RawTransport::Pipe) => Some(TransportKind::Pipe),
        Some(RawTransport::Socket) => Some(TransportKind::Socket {
            port: raw.port.unwrap_or(0),
        }),
    };

    match (raw.command, raw.module, raw.host) {
        (Some(command), None, None) => {
            if command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "server command must not be empty".into(),
                ));
            }
            let name = Path::new(&command)
                .file_stem()
                .map_or_else(|| command.clone(), |s| s.to_string_lossy().into_owned());
            Ok((
                name,
                ServerOptions::Executable(Executable {
                    command,
                    args: raw.args,
                    cwd: raw.cwd,
                    env: raw.env,
                    transport,
                }),
            ))
        }
        (None, Some(module), None) => {
            let name = module
                .file_stem()
                .map_or_else(|| "server".to_string(), |s| s.to_string_lossy().into_owned());
            Ok((
                name,
                ServerOptions::Module(NodeModule {
                    module,
                    runtime: raw.runtime,
                    args: raw.args,
                    cwd: raw.cwd,
                    env: raw.env,
                    transport: transport.unwrap_or(TransportKind::Ipc),
                }),
            ))
        }
        (None, None, Some(host)) => {
            let port = raw.port.ok_or_else(|| {
                ConfigError::Invalid("`port` is required when connecting to `host`".into())
            })?;
            Ok((format!("{host}:{port}"), ServerOptions::Tcp { host, port }))
        }
        (None, None, None) => Err(ConfigError::Invalid(
            "server needs one of `command`, `module` or `host`".into(),
        )),
        _ => Err(ConfigError::Invalid(
            "`command`, `module` and `host` are mutually exclusive".into(),
        )),
    }
}
