use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobOutcome};
use crate::status::ModuleStatus;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle event emitted by a module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub timestamp: DateTime<Utc>,
    pub module: String,
    pub payload: SchedulerEventPayload,
}

impl SchedulerEvent {
    pub fn new(module: impl Into<String>, payload: SchedulerEventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            payload,
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match &self.payload {
            SchedulerEventPayload::JobQueued { job_id, .. }
            | SchedulerEventPayload::JobStarted { job_id, .. }
            | SchedulerEventPayload::JobSuspended { job_id }
            | SchedulerEventPayload::JobRequeued { job_id }
            | SchedulerEventPayload::JobResumed { job_id }
            | SchedulerEventPayload::JobFinished { job_id, .. } => Some(*job_id),
            SchedulerEventPayload::StatusChanged { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SchedulerEventPayload {
    /// Job was pushed onto its module's queue.
    JobQueued {
        job_id: JobId,
        name: String,
        priority: i32,
    },
    /// Job body started running.
    JobStarted { job_id: JobId, name: String },
    /// Job gave up its slot to wait for children.
    JobSuspended { job_id: JobId },
    /// All children finished; job is waiting for readmission.
    JobRequeued { job_id: JobId },
    /// Job was readmitted and its children's results delivered.
    JobResumed { job_id: JobId },
    /// Job settled.
    JobFinished {
        job_id: JobId,
        name: String,
        outcome: JobOutcome,
        duration_ms: f64,
    },
    /// Module moved to a new lifecycle status.
    StatusChanged {
        from: ModuleStatus,
        to: ModuleStatus,
    },
}

/// In-process fan-out bus for [`SchedulerEvent`]s.
///
/// Publishing never blocks. Subscribers that fall behind the capacity get
/// `RecvError::Lagged` and skip ahead; the publisher is unaffected.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Dropped silently if there are none.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}
