//! Language Server Protocol client runtime.
//!
//! Launches a server over stdio, a pipe, a socket or a host-supplied
//! transport, keeps documents synchronized, and gathers diagnostics from
//! both the push and the pull model.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod features;
pub mod middleware;
pub mod policy;
pub mod protocol;
pub mod selector;
pub mod transport;
pub mod types;
pub mod workspace;

pub(crate) mod connection;

mod client;

pub use client::LanguageClient;
pub use config::{ClientOptions, DiagnosticPullOptions, PullTrigger};
pub use diagnostics::DiagnosticCollection;
pub use error::{ConfigError, LspError, Result};
pub use features::diagnostic::DiagnosticFeature;
pub use middleware::Middleware;
pub use policy::{CloseAction, CloseHandlerResult, DefaultErrorHandler, ErrorAction, ErrorHandler};
pub use protocol::{ResponseError, ServerInfo};
pub use selector::{DocumentFilter, DocumentSelector};
pub use transport::{ServerOptions, Transport, TransportFactory};
pub use types::{
    ClientEvent, ClientState, Diagnostic, DiagnosticSeverity, MessageType, Position, Range,
    TextDocument, TextDocumentChangeEvent, TextDocumentContentChangeEvent, TextDocumentSaveReason,
    TextEdit, WillSaveEvent,
};
pub use workspace::{MemoryWorkspace, Workspace};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
