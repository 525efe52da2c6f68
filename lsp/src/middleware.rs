//! User middleware around outbound document notifications and inbound
//! diagnostics.
//!
//! A hook receives the event and a `next` continuation. It may call `next`
//! with the original or a transformed event, skip it to drop the message, or
//! return an error. Errors are logged by the caller and the message is
//! dropped; they never tear down the client.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::types::{Diagnostic, TextDocument, TextDocumentChangeEvent, TextEdit, WillSaveEvent};

/// Continuation handed to a hook.
pub type Next<E, R = ()> = Box<dyn FnOnce(E) -> BoxFuture<'static, Result<R>> + Send>;

pub type Hook<E, R = ()> = Arc<dyn Fn(E, Next<E, R>) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Diagnostics about to be stored for a document.
#[derive(Debug, Clone)]
pub struct DiagnosticsEvent {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Clone, Default)]
pub struct Middleware {
    did_open: Option<Hook<TextDocument>>,
    did_change: Option<Hook<TextDocumentChangeEvent>>,
    will_save: Option<Hook<WillSaveEvent>>,
    will_save_wait_until: Option<Hook<WillSaveEvent, Vec<TextEdit>>>,
    did_save: Option<Hook<TextDocument>>,
    did_close: Option<Hook<TextDocument>>,
    handle_diagnostics: Option<Hook<DiagnosticsEvent>>,
}

macro_rules! hook_setter {
    ($name:ident, $event:ty) => {
        hook_setter!($name, $event, ());
    };
    ($name:ident, $event:ty, $ret:ty) => {
        #[must_use]
        pub fn $name<F>(mut self, hook: F) -> Self
        where
            F: Fn($event, Next<$event, $ret>) -> BoxFuture<'static, Result<$ret>>
                + Send
                + Sync
                + 'static,
        {
            self.$name = Some(Arc::new(hook));
            self
        }
    };
}

impl Middleware {
    hook_setter!(did_open, TextDocument);
    hook_setter!(did_change, TextDocumentChangeEvent);
    hook_setter!(will_save, WillSaveEvent);
    hook_setter!(will_save_wait_until, WillSaveEvent, Vec<TextEdit>);
    hook_setter!(did_save, TextDocument);
    hook_setter!(did_close, TextDocument);
    hook_setter!(handle_diagnostics, DiagnosticsEvent);

    pub(crate) fn did_open_hook(&self) -> Option<&Hook<TextDocument>> {
        self.did_open.as_ref()
    }

    pub(crate) fn did_change_hook(&self) -> Option<&Hook<TextDocumentChangeEvent>> {
        self.did_change.as_ref()
    }

    pub(crate) fn will_save_hook(&self) -> Option<&Hook<WillSaveEvent>> {
        self.will_save.as_ref()
    }

    pub(crate) fn will_save_wait_until_hook(&self) -> Option<&Hook<WillSaveEvent, Vec<TextEdit>>> {
        self.will_save_wait_until.as_ref()
    }

    pub(crate) fn did_save_hook(&self) -> Option<&Hook<TextDocument>> {
        self.did_save.as_ref()
    }

    pub(crate) fn did_close_hook(&self) -> Option<&Hook<TextDocument>> {
        self.did_close.as_ref()
    }

    pub(crate) fn handle_diagnostics_hook(&self) -> Option<&Hook<DiagnosticsEvent>> {
        self.handle_diagnostics.as_ref()
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("did_open", &self.did_open.is_some())
            .field("did_change", &self.did_change.is_some())
            .field("will_save", &self.will_save.is_some())
            .field("will_save_wait_until", &self.will_save_wait_until.is_some())
            .field("did_save", &self.did_save.is_some())
            .field("did_close", &self.did_close.is_some())
            .field("handle_diagnostics", &self.handle_diagnostics.is_some())
            .finish()
    }
}

/// Run `event` through `hook`, or straight into `next` when no hook is set.
pub(crate) async fn run<E, R>(hook: Option<&Hook<E, R>>, event: E, next: Next<E, R>) -> Result<R>
where
    E: Send + 'static,
    R: Send + 'static,
{
    match hook {
        Some(hook) => hook(event, next).await,
        None => next(event).await,
    }
}
