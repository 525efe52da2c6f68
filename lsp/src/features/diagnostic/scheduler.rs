//! Single-flight queue that orders document pulls.
//!
//! One worker takes the head of a FIFO of distinct keys and awaits its pull
//! before taking the next, so at most one pull is in flight. Removing a queued
//! key gives it one last pull ahead of the queue; removing the in-flight key
//! lets that pull finish but cancels any rerun.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Done,
    /// Queue the key again, e.g. after a server-cancelled pull.
    Reschedule,
}

pub trait PullRequestor: Send + Sync + 'static {
    fn pull(&self, key: String) -> BoxFuture<'static, PullOutcome>;
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: VecDeque<String>,
    last_pulls: VecDeque<String>,
    in_flight: Option<String>,
    rerun: bool,
}

impl SchedulerState {
    fn is_waiting(&self, key: &str) -> bool {
        self.queue.iter().any(|k| k == key) || self.last_pulls.iter().any(|k| k == key)
    }

    fn next(&mut self) -> Option<String> {
        let key = self
            .last_pulls
            .pop_front()
            .or_else(|| self.queue.pop_front())?;
        self.in_flight = Some(key.clone());
        self.rerun = false;
        Some(key)
    }
}

pub struct BackgroundScheduler {
    state: Arc<Mutex<SchedulerState>>,
    wake: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl BackgroundScheduler {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(requestor: Arc<dyn PullRequestor>) -> Self {
        let state = Arc::new(Mutex::new(SchedulerState::default()));
        let wake = Arc::new(Notify::new());
        let worker = tokio::spawn(run(requestor, state.clone(), wake.clone()));
        Self {
            state,
            wake,
            worker,
        }
    }

    /// Queue `key` unless it is already waiting. Adding the in-flight key
    /// schedules exactly one rerun after it completes.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = lock(&self.state);
            if state.in_flight.as_deref() == Some(key.as_str()) {
                state.rerun = true;
                return;
            }
            if state.is_waiting(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.wake.notify_one();
    }

    pub fn remove(&self, key: &str) {
        {
            let mut state = lock(&self.state);
            if state.in_flight.as_deref() == Some(key) {
                state.rerun = false;
            }
            let Some(index) = state.queue.iter().position(|k| k == key) else {
                return;
            };
            state.queue.remove(index);
            state.last_pulls.push_back(key.to_string());
        }
        self.wake.notify_one();
    }

    /// Keys waiting to be pulled, in pull order.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .last_pulls
            .iter()
            .chain(state.queue.iter())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.in_flight.is_none() && state.queue.is_empty() && state.last_pulls.is_empty()
    }

    /// Forget everything queued. An in-flight pull still completes.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.queue.clear();
        state.last_pulls.clear();
        state.rerun = false;
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(requestor: Arc<dyn PullRequestor>, state: Arc<Mutex<SchedulerState>>, wake: Arc<Notify>) {
    loop {
        let next = lock(&state).next();
        let Some(key) = next else {
            wake.notified().await;
            continue;
        };

        let outcome = requestor.pull(key.clone()).await;

        let mut guard = lock(&state);
        guard.in_flight = None;
        let again = outcome == PullOutcome::Reschedule || guard.rerun;
        guard.rerun = false;
        if again && !guard.is_waiting(&key) {
            tracing::trace!(%key, "re-queueing pull");
            guard.queue.push_back(key);
        }
    }
}
