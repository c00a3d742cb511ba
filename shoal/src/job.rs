use std::fmt::{self, Display};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::JobError;
use crate::module::ModuleInner;
use crate::progress::{Debounced, ProgressEvent, ProgressListener, ProgressTracker};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Initialized,
    Queued,
    Running,
    /// Suspended until every child has finished; holds no concurrency slot.
    WaitingOnChild,
    /// All children finished; waiting for readmission so their results can
    /// be handed to the suspended body. The body is not run again.
    Requeued,
    Finished,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Initialized => "INITIALIZED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::WaitingOnChild => "WAITING_ON_CHILD",
            JobStatus::Requeued => "REQUEUED",
            JobStatus::Finished => "FINISHED",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Resolved,
    Rejected,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Resolved => "resolved",
            JobOutcome::Rejected => "rejected",
        }
    }
}

/// Settled value of a finished job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    Resolved(Value),
    Rejected(JobError),
}

impl JobResult {
    pub fn outcome(&self) -> JobOutcome {
        match self {
            JobResult::Resolved(_) => JobOutcome::Resolved,
            JobResult::Rejected(_) => JobOutcome::Rejected,
        }
    }

    pub fn into_result(self) -> Result<Value, JobError> {
        match self {
            JobResult::Resolved(value) => Ok(value),
            JobResult::Rejected(err) => Err(err),
        }
    }
}

impl From<Result<Value, JobError>> for JobResult {
    fn from(result: Result<Value, JobError>) -> Self {
        match result {
            Ok(value) => JobResult::Resolved(value),
            Err(err) => JobResult::Rejected(err),
        }
    }
}

/// A request to run a named job on a module.
///
/// ```ignore
/// let completion = module.run_job(
///     JobRequest::new("reindex")
///         .with_payload(json!({ "table": "users" }))
///         .with_priority(2),
/// );
/// let value = completion.await?;
/// ```
pub struct JobRequest {
    pub(crate) name: String,
    pub(crate) payload: Value,
    pub(crate) priority: Option<i32>,
    pub(crate) keep_alive: bool,
    pub(crate) listener: Option<Arc<dyn ProgressListener>>,
    pub(crate) parent: Option<Arc<Job>>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
            priority: None,
            keep_alive: false,
            listener: None,
            parent: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the module's default priority. `-1` bypasses admission control.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Keep the job registered after it finishes, until it is released.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn on_progress<L>(mut self, listener: L) -> Self
    where
        L: ProgressListener + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run as a child of `parent`. The parent is suspended until all of its
    /// children finish.
    pub fn with_parent(mut self, parent: &Arc<Job>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("name", &self.name)
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("keep_alive", &self.keep_alive)
            .field("has_listener", &self.listener.is_some())
            .field("parent", &self.parent.as_ref().map(|p| p.id()))
            .finish()
    }
}

/// Everything needed to construct a [`Job`].
pub(crate) struct JobSpec {
    pub name: String,
    pub module: String,
    pub payload: Value,
    pub priority: i32,
    pub keep_alive: bool,
    pub parent: Option<Weak<Job>>,
    pub owner: Weak<ModuleInner>,
    pub listener: Option<Arc<dyn ProgressListener>>,
    pub progress_interval: Duration,
}

#[cfg(test)]
impl JobSpec {
    /// A job that belongs to no module, for exercising queues and trackers.
    pub(crate) fn detached(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            module: "detached".to_string(),
            payload: Value::Null,
            priority,
            keep_alive: false,
            parent: None,
            owner: Weak::new(),
            listener: None,
            progress_interval: crate::progress::DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

struct JobState {
    status: JobStatus,
    children: Vec<Arc<Job>>,
    result: Option<JobResult>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// What happened to a parent when one of its children finished.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChildSettlement {
    /// Every child is finished; the parent is now `REQUEUED`.
    Requeue,
    /// Other children are still outstanding.
    Waiting,
    /// The parent was not waiting on children.
    Inconsistent(JobStatus),
}

/// What a readmitted `REQUEUED` job must do.
pub(crate) enum Resumption {
    /// The job is running again; deliver these children's results.
    Deliver(Vec<Arc<Job>>),
    /// A child was added while requeued and has not finished yet.
    Wait,
}

/// A unit of work owned by a module.
///
/// Children are owned by their parent; the parent link is weak so the tree
/// is dropped from the root.
pub struct Job {
    id: JobId,
    name: String,
    module: String,
    payload: Value,
    priority: i32,
    keep_alive: AtomicBool,
    created_at: DateTime<Utc>,
    parent: Option<Weak<Job>>,
    owner: Weak<ModuleInner>,
    state: Mutex<JobState>,
    progress: ProgressTracker,
    delivery: Mutex<Option<oneshot::Sender<JobResult>>>,
}

impl Job {
    pub(crate) fn new(spec: JobSpec) -> (Arc<Self>, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let job = Arc::new(Self {
            id: JobId::new(),
            name: spec.name,
            module: spec.module,
            payload: spec.payload,
            priority: spec.priority,
            keep_alive: AtomicBool::new(spec.keep_alive),
            created_at: Utc::now(),
            parent: spec.parent,
            owner: spec.owner,
            state: Mutex::new(JobState {
                status: JobStatus::Initialized,
                children: Vec::new(),
                result: None,
                started_at: None,
                finished_at: None,
            }),
            progress: ProgressTracker::new(spec.progress_interval, spec.listener),
            delivery: Mutex::new(Some(tx)),
        });
        (job, rx)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the module that owns this job.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Long jobs stay registered after completion until released, and
    /// never forward progress to their parent.
    pub fn is_long(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub fn set_long(&self, keep_alive: bool) {
        self.keep_alive.store(keep_alive, Ordering::Release);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn parent(&self) -> Option<Arc<Job>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Job>> {
        self.state.lock().children.clone()
    }

    pub fn result(&self) -> Option<JobResult> {
        self.state.lock().result.clone()
    }

    pub fn last_progress(&self) -> Option<ProgressEvent> {
        self.progress.last()
    }

    /// Attach a listener after the job was created. Used for long jobs
    /// whose observers arrive later.
    pub fn attach_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.progress.set_listener(listener);
    }

    /// Walk up to the job at the top of this job's tree.
    pub fn root(self: &Arc<Self>) -> Arc<Job> {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    pub(crate) fn owner(&self) -> Option<Arc<ModuleInner>> {
        self.owner.upgrade()
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.state.lock().status = status;
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        state.status = JobStatus::Running;
        state.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&self, result: JobResult) {
        let mut state = self.state.lock();
        state.status = JobStatus::Finished;
        state.result = Some(result);
        state.finished_at = Some(Utc::now());
    }

    /// Record `child` under this job. Returns true when this job was running
    /// and must now be suspended.
    pub(crate) fn adopt_child(&self, child: Arc<Job>) -> bool {
        let mut state = self.state.lock();
        state.children.push(child);
        if state.status == JobStatus::Running {
            state.status = JobStatus::WaitingOnChild;
            true
        } else {
            false
        }
    }

    pub(crate) fn child_finished(&self) -> ChildSettlement {
        let mut state = self.state.lock();
        match state.status {
            JobStatus::WaitingOnChild => {}
            // Already pending readmission; `resume` rechecks the children.
            JobStatus::Requeued => return ChildSettlement::Waiting,
            status => return ChildSettlement::Inconsistent(status),
        }
        if all_finished(&state.children) {
            state.status = JobStatus::Requeued;
            ChildSettlement::Requeue
        } else {
            ChildSettlement::Waiting
        }
    }

    pub(crate) fn resume(&self) -> Resumption {
        let mut state = self.state.lock();
        if all_finished(&state.children) {
            state.status = JobStatus::Running;
            Resumption::Deliver(state.children.clone())
        } else {
            state.status = JobStatus::WaitingOnChild;
            Resumption::Wait
        }
    }

    /// Hand the settled result to whoever awaits this job.
    ///
    /// Only the first call sends anything; later calls return false.
    pub(crate) fn deliver(&self) -> bool {
        let Some(result) = self.result() else {
            return false;
        };
        match self.delivery.lock().take() {
            Some(tx) => {
                // The receiver may have been dropped; that is not an error.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Report progress from inside the job body.
    pub fn report_progress(self: &Arc<Self>, event: ProgressEvent) {
        let _ordered = self.progress.ordered();
        match self.progress.debounce(Arc::downgrade(self), event) {
            Debounced::Emit(event) => self.emit_progress(self.id, &event),
            Debounced::Buffered => {}
        }
    }

    pub(crate) fn flush_progress(&self) {
        let _ordered = self.progress.ordered();
        if let Some(event) = self.progress.take_pending() {
            self.emit_progress(self.id, &event);
        }
    }

    fn emit_progress(&self, origin: JobId, event: &ProgressEvent) {
        if let Some(listener) = self.progress.listener() {
            listener.on_progress(origin, event);
            return;
        }
        if self.is_long() {
            return;
        }
        if let Some(parent) = self.parent() {
            parent.emit_progress(origin, event);
        }
    }

    /// Snapshot this job and all of its descendants.
    pub fn tree(&self) -> JobTree {
        let (status, result, started_at, finished_at, children) = {
            let state = self.state.lock();
            (
                state.status,
                state.result.clone(),
                state.started_at,
                state.finished_at,
                state.children.clone(),
            )
        };
        JobTree {
            id: self.id,
            name: self.name.clone(),
            module: self.module.clone(),
            status,
            priority: self.priority,
            long: self.is_long(),
            result,
            progress: self.last_progress(),
            created_at: self.created_at,
            started_at,
            finished_at,
            children: children.iter().map(|child| child.tree()).collect(),
        }
    }
}

fn all_finished(children: &[Arc<Job>]) -> bool {
    children
        .iter()
        .all(|child| child.status() == JobStatus::Finished)
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.try_lock();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("module", &self.module)
            .field("priority", &self.priority)
            .field("long", &self.is_long())
            .field("status", &state.as_ref().map(|s| s.status))
            .field("children", &state.as_ref().map(|s| s.children.len()))
            .finish()
    }
}

/// Serializable view of a job and its descendants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobTree {
    pub id: JobId,
    pub name: String,
    pub module: String,
    pub status: JobStatus,
    pub priority: i32,
    pub long: bool,
    pub result: Option<JobResult>,
    pub progress: Option<ProgressEvent>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub children: Vec<JobTree>,
}

impl JobTree {
    pub fn find(&self, id: JobId) -> Option<&JobTree> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }
}

/// Resolves with the job's value once its result is delivered.
///
/// Results of child jobs are delivered only after their parent has been
/// readmitted by the scheduler, or straight away if the parent stopped
/// waiting. Dropping a completion does not cancel the job.
#[must_use = "a completion does nothing unless awaited"]
#[derive(Debug)]
pub struct JobCompletion {
    job_id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobCompletion {
    pub(crate) fn new(job_id: JobId, rx: oneshot::Receiver<JobResult>) -> Self {
        Self { job_id, rx }
    }

    /// A completion that resolves straight away with an error.
    pub(crate) fn rejected(err: JobError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(JobResult::Rejected(err));
        Self {
            job_id: JobId::new(),
            rx,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for JobCompletion {
    type Output = Result<Value, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(result) => result.into_result(),
            Err(_) => Err(JobError::Abandoned),
        })
    }
}
