//! Modules: a queue, a table of named job handlers and a lifecycle status.

mod builder;
mod context;
mod executor;

pub use builder::ModuleBuilder;
pub(crate) use builder::Wiring;
pub use context::JobContext;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::{JobError, Result, SchedulerError};
use crate::events::{EventBus, SchedulerEvent, SchedulerEventPayload};
use crate::handler::{JobGuard, JobHandler, ModuleInitializer};
use crate::job::{Job, JobCompletion, JobRequest, JobSpec};
use crate::job_manager::JobManager;
use crate::manager::{ManagerInner, ModuleManager};
use crate::queue::{Queue, QueueSnapshot};
use crate::statistics::{JobStatistics, ModuleStatistics};
use crate::status::ModuleStatus;
use crate::telemetry;

/// A named owner of one queue and a set of job handlers.
///
/// Cheap to clone; all clones share the same module.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

pub(crate) struct ModuleInner {
    name: String,
    status: Mutex<ModuleStatus>,
    queue: Queue,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    priorities: HashMap<String, i32>,
    default_priority: i32,
    progress_interval: Duration,
    initialize_timeout: Option<Duration>,
    guard: Option<Arc<dyn JobGuard>>,
    initializer: Option<Arc<dyn ModuleInitializer>>,
    statistics: ModuleStatistics,
    consistency_violations: AtomicU64,
    jobs: Arc<JobManager>,
    events: EventBus,
    manager: Weak<ManagerInner>,
}

/// Status, queue depths and health of one module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleReport {
    pub name: String,
    pub status: ModuleStatus,
    pub queue: QueueSnapshot,
    pub consistency_violations: u64,
}

impl Module {
    pub(crate) fn from_inner(inner: Arc<ModuleInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> ModuleStatus {
        *self.inner.status.lock()
    }

    /// Move the module to `next`.
    ///
    /// `READY` resumes the queue; `FAILED` and `LOCKDOWN` pause it. Returns
    /// false, and changes nothing, once the module is in lockdown.
    pub fn set_status(&self, next: ModuleStatus) -> bool {
        self.inner.set_status(next)
    }

    /// Submit a job by name.
    ///
    /// Unknown names resolve immediately with [`JobError::UnknownJob`].
    pub fn run_job(&self, request: JobRequest) -> JobCompletion {
        self.inner.submit(request)
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.inner.handlers.contains_key(name)
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    pub fn concurrency(&self) -> usize {
        self.inner.queue.concurrency()
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        tracing::info!(module = %self.inner.name, concurrency, "concurrency changed");
        self.inner.queue.set_concurrency(concurrency);
    }

    /// Priority a job gets when the caller does not name one.
    pub fn priority_for(&self, job: &str) -> i32 {
        self.inner.priority_for(job)
    }

    pub fn statistics(&self) -> BTreeMap<String, JobStatistics> {
        self.inner.statistics.snapshot()
    }

    pub fn job_statistics(&self, job: &str) -> Option<JobStatistics> {
        self.inner.statistics.get(job)
    }

    /// Children that finished while their parent was not waiting on them.
    /// Always zero unless the scheduler has a bug.
    pub fn consistency_violations(&self) -> u64 {
        self.inner.consistency_violations.load(Ordering::Relaxed)
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.inner.jobs
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The manager this module is registered with, if any.
    pub fn manager(&self) -> Option<ModuleManager> {
        self.inner.manager.upgrade().map(ModuleManager::from_inner)
    }

    pub fn report(&self) -> ModuleReport {
        ModuleReport {
            name: self.inner.name.clone(),
            status: self.status(),
            queue: self.inner.queue.snapshot(),
            consistency_violations: self.consistency_violations(),
        }
    }

    /// Run the initializer and settle on `READY` or `FAILED`.
    pub async fn initialize(&self) -> Result<()> {
        let name = self.inner.name.clone();
        if !self.set_status(ModuleStatus::Initializing) {
            return Err(SchedulerError::Lockdown);
        }

        let outcome: anyhow::Result<()> = async {
            let Some(initializer) = self.inner.initializer.clone() else {
                return Ok(());
            };
            match self.inner.initialize_timeout {
                Some(limit) => tokio::time::timeout(limit, initializer.initialize(self))
                    .await
                    .map_err(|_| anyhow::anyhow!("initializer timed out after {limit:?}"))?,
                None => initializer.initialize(self).await,
            }
        }
        .instrument(telemetry::module_initialize_span(&name))
        .await;

        match outcome {
            Ok(()) => {
                if self.set_status(ModuleStatus::Ready) {
                    Ok(())
                } else {
                    Err(SchedulerError::Lockdown)
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::error!(module = %name, error = %reason, "module failed to initialize");
                self.set_status(ModuleStatus::Failed);
                Err(SchedulerError::InitializeFailed {
                    module: name,
                    reason,
                })
            }
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("queue", &self.inner.queue)
            .field("jobs", &self.job_names())
            .field("guarded", &self.inner.guard.is_some())
            .finish()
    }
}

impl ModuleInner {
    pub(crate) fn publish(&self, payload: SchedulerEventPayload) {
        self.events.publish(SchedulerEvent::new(self.name.clone(), payload));
    }

    fn priority_for(&self, job: &str) -> i32 {
        self.priorities
            .get(job)
            .copied()
            .unwrap_or(self.default_priority)
    }

    fn set_status(&self, next: ModuleStatus) -> bool {
        let previous = {
            let mut status = self.status.lock();
            if status.is_terminal() {
                tracing::debug!(
                    module = %self.name,
                    requested = %next,
                    "ignoring status change during lockdown"
                );
                return false;
            }
            let previous = *status;
            *status = next;
            // Queue changes happen under the status lock so concurrent
            // transitions leave the queue matching the final status.
            match next {
                ModuleStatus::Ready => self.queue.resume(),
                ModuleStatus::Failed | ModuleStatus::Lockdown => self.queue.pause(),
                _ => {}
            }
            previous
        };

        tracing::info!(module = %self.name, from = %previous, to = %next, "module status changed");
        self.publish(SchedulerEventPayload::StatusChanged {
            from: previous,
            to: next,
        });
        true
    }

    fn submit(self: &Arc<Self>, request: JobRequest) -> JobCompletion {
        if !self.handlers.contains_key(&request.name) {
            tracing::warn!(module = %self.name, job = %request.name, "unknown job requested");
            return JobCompletion::rejected(JobError::UnknownJob {
                module: self.name.clone(),
                name: request.name,
            });
        }

        let priority = request
            .priority
            .unwrap_or_else(|| self.priority_for(&request.name));
        self.statistics.record_added(&request.name);

        let parent = request.parent;
        let (job, rx) = Job::new(JobSpec {
            name: request.name,
            module: self.name.clone(),
            payload: request.payload,
            priority,
            keep_alive: request.keep_alive,
            parent: parent.as_ref().map(Arc::downgrade),
            owner: Arc::downgrade(self),
            listener: request.listener,
            progress_interval: self.progress_interval,
        });
        let completion = JobCompletion::new(job.id(), rx);

        // The parent leaves its slot before the child is queued, but the
        // freed slot is only handed out once the child is pending too.
        let suspended = parent.as_ref().and_then(|parent| {
            if !parent.adopt_child(Arc::clone(&job)) {
                return None;
            }
            let owner = parent.owner()?;
            if owner.queue.hold(parent.id()) {
                owner.publish(SchedulerEventPayload::JobSuspended {
                    job_id: parent.id(),
                });
            }
            Some(owner)
        });

        telemetry::record_job_enqueued(&self.name, job.name(), priority);
        self.publish(SchedulerEventPayload::JobQueued {
            job_id: job.id(),
            name: job.name().to_string(),
            priority,
        });
        self.queue.enqueue(job, priority);

        if let Some(owner) = suspended {
            owner.queue.schedule();
        }
        completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::job::JobStatus;
    use serde_json::{Value, json};

    fn echo_module() -> Module {
        ModuleBuilder::new("echo")
            .with_concurrency(2)
            .with_priority("slow", 42)
            .with_job("echo", handler_fn(|_ctx, payload| async move { Ok(payload) }))
            .with_job(
                "slow",
                handler_fn(|_ctx, _payload| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Value::Null)
                }),
            )
            .build()
            .expect("module builds")
    }

    #[tokio::test]
    async fn runs_jobs_once_ready() {
        let module = echo_module();
        module.initialize().await.unwrap();
        assert_eq!(module.status(), ModuleStatus::Ready);

        let value = module
            .run_job(JobRequest::new("echo").with_payload(json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(value, json!({ "n": 1 }));

        let stats = module.job_statistics("echo").unwrap();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.successful, 1);
    }

    #[tokio::test]
    async fn unknown_job_is_rejected_without_queueing() {
        let module = echo_module();
        let err = module.run_job(JobRequest::new("missing")).await.unwrap_err();
        assert_eq!(
            err,
            JobError::UnknownJob {
                module: "echo".into(),
                name: "missing".into()
            }
        );
        assert_eq!(module.queue().snapshot().pending, 0);
    }

    #[tokio::test]
    async fn priority_resolution_and_pending_until_ready() {
        let module = echo_module();
        assert_eq!(module.priority_for("slow"), 42);
        assert_eq!(module.priority_for("echo"), crate::config::DEFAULT_PRIORITY);

        let completion = module.run_job(JobRequest::new("slow"));
        let job = module.jobs().find_job(completion.job_id());
        // Not started yet: the module is still uninitialized.
        assert!(job.is_none());
        assert_eq!(module.queue().snapshot().pending, 1);
    }

    #[tokio::test]
    async fn lockdown_is_one_way() {
        let module = echo_module();
        assert!(module.set_status(ModuleStatus::Lockdown));
        assert!(!module.set_status(ModuleStatus::Ready));
        assert_eq!(module.status(), ModuleStatus::Lockdown);
        assert!(module.queue().is_paused());
        assert!(matches!(
            module.initialize().await,
            Err(SchedulerError::Lockdown)
        ));
    }

    #[tokio::test]
    async fn keep_alive_jobs_stay_registered() {
        let module = echo_module();
        module.initialize().await.unwrap();

        let completion = module.run_job(JobRequest::new("echo").with_keep_alive(true));
        let id = completion.job_id();
        completion.await.unwrap();

        let job = module.jobs().find_job(id).expect("long job retained");
        assert_eq!(job.status(), JobStatus::Finished);
        module.jobs().release(id).unwrap();
        assert!(module.jobs().find_job(id).is_none());
    }
}
