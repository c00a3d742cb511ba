//! Progress events and per-job debouncing.
//!
//! Jobs report progress through [`JobContext::progress`](crate::JobContext::progress).
//! `update` events are rate limited per job: the first one in a window is
//! emitted straight away, later ones are buffered and the newest buffered
//! event is emitted when the window closes. `success` and `error` events
//! cancel any buffered update and are emitted immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::job::{Job, JobId};

/// Default debounce window for `update` events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Update,
    Success,
    Error,
}

/// A single progress report emitted by a running job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ProgressEvent {
    pub fn update(message: impl Into<String>) -> Self {
        Self::new(ProgressStatus::Update, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ProgressStatus::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ProgressStatus::Error, message)
    }

    fn new(status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            data: Value::Null,
        }
    }

    /// Attach structured data to the event.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ProgressStatus::Update
    }
}

/// Receives progress events for a job and, unless the job is long-lived,
/// for every descendant that has no listener of its own.
///
/// The `JobId` passed in is the job that reported the event.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, job_id: JobId, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(JobId, &ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, job_id: JobId, event: &ProgressEvent) {
        self(job_id, event)
    }
}

/// Per-job progress bookkeeping: the listener, the last reported event and
/// the debounce window.
pub(crate) struct ProgressTracker {
    interval: Duration,
    listener: Mutex<Option<Arc<dyn ProgressListener>>>,
    state: Mutex<DebounceState>,
    // Held from the debounce decision until the listener returns, so a timer
    // flush cannot land after a terminal event. Re-entrant for listeners
    // that report progress themselves.
    emitting: ReentrantMutex<()>,
}

#[derive(Default)]
struct DebounceState {
    last: Option<ProgressEvent>,
    last_emitted: Option<Instant>,
    pending: Option<ProgressEvent>,
    timer: Option<JoinHandle<()>>,
}

/// What the caller must do after the tracker has processed an event.
pub(crate) enum Debounced {
    Emit(ProgressEvent),
    Buffered,
}

impl ProgressTracker {
    pub(crate) fn new(interval: Duration, listener: Option<Arc<dyn ProgressListener>>) -> Self {
        Self {
            interval,
            listener: Mutex::new(listener),
            state: Mutex::new(DebounceState::default()),
            emitting: ReentrantMutex::new(()),
        }
    }

    /// Serializes emission for this job. Hold the guard across the
    /// debounce or flush and the listener call that follows it.
    pub(crate) fn ordered(&self) -> ReentrantMutexGuard<'_, ()> {
        self.emitting.lock()
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn ProgressListener>> {
        self.listener.lock().clone()
    }

    pub(crate) fn set_listener(&self, listener: Arc<dyn ProgressListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn last(&self) -> Option<ProgressEvent> {
        self.state.lock().last.clone()
    }

    /// Run an event through the debounce window.
    ///
    /// When an update has to wait, a timer is armed that calls
    /// [`Job::flush_progress`] once the remaining part of the window elapses.
    /// Any previously armed timer is aborted first.
    pub(crate) fn debounce(&self, job: Weak<Job>, event: ProgressEvent) -> Debounced {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last = Some(event.clone());

        if event.is_terminal() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending = None;
            state.last_emitted = Some(now);
            return Debounced::Emit(event);
        }

        let elapsed = state.last_emitted.map(|at| now.saturating_duration_since(at));
        match elapsed {
            Some(elapsed) if elapsed < self.interval => {
                state.pending = Some(event);
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                let remaining = self.interval - elapsed;
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(remaining).await;
                    if let Some(job) = job.upgrade() {
                        job.flush_progress();
                    }
                }));
                Debounced::Buffered
            }
            _ => {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                state.pending = None;
                state.last_emitted = Some(now);
                Debounced::Emit(event)
            }
        }
    }

    /// Take the buffered update, if any, once its window has closed.
    pub(crate) fn take_pending(&self) -> Option<ProgressEvent> {
        let mut state = self.state.lock();
        state.timer = None;
        let event = state.pending.take()?;
        state.last_emitted = Some(Instant::now());
        Some(event)
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.try_lock();
        f.debug_struct("ProgressTracker")
            .field("interval", &self.interval)
            .field("has_listener", &self.listener.try_lock().map(|l| l.is_some()))
            .field("pending", &state.as_ref().map(|s| s.pending.is_some()))
            .finish()
    }
}
