//! Error and restart policy.
//!
//! The client asks an [`ErrorHandler`] what to do when the connection reports
//! an error and when it closes unexpectedly. The default handler restarts a
//! crashed server until it crashes too often within a sliding window.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::LspError;
use crate::lock;

pub const DEFAULT_MAX_RESTART_COUNT: usize = 4;

pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(180);

/// Connection errors tolerated before the default handler shuts down.
const MAX_TOLERATED_ERRORS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Restart,
    DoNotRestart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseHandlerResult {
    pub action: CloseAction,
    /// Shown to the user when set.
    pub message: Option<String>,
}

impl CloseHandlerResult {
    #[must_use]
    pub fn restart() -> Self {
        Self {
            action: CloseAction::Restart,
            message: None,
        }
    }

    #[must_use]
    pub fn do_not_restart(message: Option<String>) -> Self {
        Self {
            action: CloseAction::DoNotRestart,
            message,
        }
    }
}

pub trait ErrorHandler: Send + Sync {
    /// A read or write failed; `count` is the running error count of the
    /// current connection.
    fn error(&self, message: &str, count: u32) -> ErrorAction;

    /// The connection closed while the client believed it was running.
    fn closed(&self) -> CloseHandlerResult;
}

/// Decides whether a failed `initialize` is retried; `attempt` starts at 1.
pub type InitializationFailedHandler = Arc<dyn Fn(&LspError, u32) -> bool + Send + Sync>;

/// Retry initialization up to `retries` extra times.
#[must_use]
pub fn retry_initialization(retries: u32) -> InitializationFailedHandler {
    Arc::new(move |error: &LspError, attempt: u32| {
        let retry = attempt <= retries;
        if retry {
            tracing::info!(attempt, "initialize failed, retrying: {error}");
        }
        retry
    })
}

/// Restart on close unless `max_restart_count` restarts already happened
/// within `window`.
#[derive(Debug)]
pub struct DefaultErrorHandler {
    name: String,
    max_restart_count: usize,
    window: Duration,
    restarts: Mutex<VecDeque<Instant>>,
}

impl DefaultErrorHandler {
    #[must_use]
    pub fn new(name: impl Into<String>, max_restart_count: usize, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_restart_count,
            window,
            restarts: Mutex::new(VecDeque::with_capacity(max_restart_count + 1)),
        }
    }

    #[must_use]
    pub fn max_restart_count(&self) -> usize {
        self.max_restart_count
    }

    fn window_label(&self) -> String {
        let secs = self.window.as_secs();
        if secs % 60 == 0 {
            let minutes = secs / 60;
            if minutes == 1 {
                "minute".to_string()
            } else {
                format!("{minutes} minutes")
            }
        } else {
            format!("{secs} seconds")
        }
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn error(&self, message: &str, count: u32) -> ErrorAction {
        if count <= MAX_TOLERATED_ERRORS {
            tracing::debug!(server = %self.name, count, "connection error: {message}");
            ErrorAction::Continue
        } else {
            tracing::warn!(server = %self.name, count, "too many connection errors: {message}");
            ErrorAction::Shutdown
        }
    }

    fn closed(&self) -> CloseHandlerResult {
        let now = Instant::now();
        let mut restarts = lock(&self.restarts);

        if restarts.len() < self.max_restart_count {
            restarts.push_back(now);
            return CloseHandlerResult::restart();
        }

        let oldest = restarts.front().copied().unwrap_or(now);
        if now.duration_since(oldest) <= self.window {
            let message = format!(
                "The {} server crashed {} times in the last {}. The server will not be restarted.",
                self.name,
                self.max_restart_count + 1,
                self.window_label()
            );
            tracing::error!(server = %self.name, "{message}");
            return CloseHandlerResult::do_not_restart(Some(message));
        }

        restarts.pop_front();
        restarts.push_back(now);
        CloseHandlerResult::restart()
    }
}
