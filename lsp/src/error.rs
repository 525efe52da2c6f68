//! Error taxonomy for the client runtime.

use std::path::PathBuf;

use crate::protocol::{
    CONTENT_MODIFIED, REQUEST_CANCELLED, ResponseError, SERVER_CANCELLED,
};

pub type Result<T, E = LspError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("language server command `{0}` not found in PATH")]
    CommandNotFound(String),

    #[error("failed to spawn language server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection to the language server closed")]
    ConnectionClosed,

    #[error("language client is not running")]
    NotRunning,

    /// The request was cancelled by the caller or the server.
    #[error("request cancelled")]
    Cancelled,

    #[error("server responded with error {code}: {message}")]
    Response {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("middleware failed: {0}")]
    Middleware(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LspError {
    /// True for errors that mean "the answer is no longer wanted" rather
    /// than "the server failed".
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Response { code, .. } => {
                matches!(*code, REQUEST_CANCELLED | CONTENT_MODIFIED | SERVER_CANCELLED)
            }
            _ => false,
        }
    }

    /// Whether a server-cancelled pull asked to be retried.
    ///
    /// Absent data means retry.
    #[must_use]
    pub fn retrigger_requested(&self) -> bool {
        match self {
            Self::Response {
                code: SERVER_CANCELLED,
                data,
                ..
            } => data
                .as_ref()
                .and_then(|d| d.get("retriggerRequest"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true),
            _ => false,
        }
    }

    pub(crate) fn from_response(error: ResponseError) -> Self {
        if error.code == REQUEST_CANCELLED {
            return Self::Cancelled;
        }
        Self::Response {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::Invalid(_) => None,
        }
    }
}
