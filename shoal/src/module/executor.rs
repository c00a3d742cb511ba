use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use super::{JobContext, Module, ModuleInner};
use crate::error::JobError;
use crate::events::SchedulerEventPayload;
use crate::job::{ChildSettlement, Job, JobResult, JobStatus, Resumption};
use crate::queue::{Task, TaskExecutor};
use crate::telemetry;

impl TaskExecutor for ModuleInner {
    fn start(self: Arc<Self>, task: Task) {
        let job = Arc::clone(task.job());
        match job.status() {
            JobStatus::Queued => {
                let run = telemetry::instrument_execute(
                    &self.name,
                    job.name(),
                    job.id(),
                    Arc::clone(&self).execute(Arc::clone(&job)),
                );
                tokio::spawn(run);
            }
            JobStatus::Requeued => self.readmit(&job),
            status => {
                tracing::error!(
                    module = %self.name,
                    job = %job.name(),
                    job_id = %job.id(),
                    %status,
                    "admitted task in unexpected status"
                );
                self.queue.finish(job.id());
            }
        }
    }
}

impl ModuleInner {
    /// First run of a job: invoke the handler, settle the result and either
    /// deliver it or hand it to the parent.
    async fn execute(self: Arc<Self>, job: Arc<Job>) {
        job.mark_running();
        self.jobs.add_job(&self.name, Arc::clone(&job));
        self.publish(SchedulerEventPayload::JobStarted {
            job_id: job.id(),
            name: job.name().to_string(),
        });
        tracing::debug!(job = %job.name(), job_id = %job.id(), "job started");

        let started = Instant::now();
        let outcome = self.invoke(&job).await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;

        if let Err(err) = &outcome {
            tracing::warn!(job = %job.name(), job_id = %job.id(), error = %err, "job rejected");
        }
        self.statistics.record(job.name(), duration_ms, outcome.is_ok());

        let result = JobResult::from(outcome);
        let outcome = result.outcome();
        telemetry::record_job_completed(&self.name, job.name(), outcome.as_str());
        telemetry::observe_job_duration(
            &self.name,
            job.name(),
            outcome.as_str(),
            elapsed.as_secs_f64(),
        );

        // A buffered update must not outlive the job. The listener is caller
        // code; a panic in it must not keep the job from settling.
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| job.flush_progress())) {
            tracing::error!(
                job = %job.name(),
                job_id = %job.id(),
                panic = %panic_message(panic.as_ref()),
                "progress listener panicked"
            );
        }
        job.finish(result);
        if !job.is_long() {
            self.jobs.remove_job(&self.name, job.id());
        }
        self.publish(SchedulerEventPayload::JobFinished {
            job_id: job.id(),
            name: job.name().to_string(),
            outcome,
            duration_ms,
        });

        // Roots deliver their own result, as do children whose parent stopped
        // waiting on them.
        let adopted = job.parent().is_some_and(|parent| self.settle_child(&parent));
        if !adopted {
            job.deliver();
        }

        // Leave the running set last: a parent resumed above must already be
        // pending when this slot frees up.
        self.queue.finish(job.id());
    }

    async fn invoke(self: &Arc<Self>, job: &Arc<Job>) -> Result<Value, JobError> {
        let Some(handler) = self.handlers.get(job.name()).cloned() else {
            return Err(JobError::UnknownJob {
                module: self.name.clone(),
                name: job.name().to_string(),
            });
        };
        let ctx = JobContext::new(Arc::clone(job), Module::from_inner(Arc::clone(self)));
        let guard = self.guard.clone().filter(|guard| guard.guards(job.name()));

        let run = async move {
            if let Some(guard) = guard {
                guard
                    .check(&ctx)
                    .await
                    .map_err(|err| JobError::Denied(format!("{err:#}")))?;
            }
            handler
                .run(ctx, job.payload().clone())
                .await
                .map_err(|err| JobError::Failed(format!("{err:#}")))
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    /// A child of `parent` finished; requeue the parent if it was the last.
    ///
    /// Returns false when the parent was not waiting on its children, in
    /// which case the child's result is not handed to it.
    fn settle_child(&self, parent: &Arc<Job>) -> bool {
        match parent.child_finished() {
            ChildSettlement::Requeue => {
                let Some(owner) = parent.owner() else {
                    tracing::warn!(
                        parent_id = %parent.id(),
                        "parent module dropped before its children finished"
                    );
                    return true;
                };
                owner.publish(SchedulerEventPayload::JobRequeued {
                    job_id: parent.id(),
                });
                owner.queue.unsuspend(parent.id());
                true
            }
            ChildSettlement::Waiting => true,
            ChildSettlement::Inconsistent(status) => {
                self.consistency_violations.fetch_add(1, Ordering::Relaxed);
                telemetry::record_consistency_violation(&self.name, status.as_str());
                tracing::error!(
                    module = %self.name,
                    parent = %parent.name(),
                    parent_id = %parent.id(),
                    %status,
                    "parent was not waiting on its children"
                );
                false
            }
        }
    }

    /// A `REQUEUED` parent got its slot back: deliver finished children's
    /// results so the suspended body continues. The body is not re-run.
    fn readmit(&self, job: &Arc<Job>) {
        match job.resume() {
            Resumption::Deliver(children) => {
                let _span =
                    telemetry::job_deliver_span(&self.name, job.id(), children.len()).entered();
                self.publish(SchedulerEventPayload::JobResumed { job_id: job.id() });
                let delivered = children.iter().filter(|child| child.deliver()).count();
                tracing::debug!(
                    job = %job.name(),
                    job_id = %job.id(),
                    delivered,
                    "children delivered"
                );
            }
            Resumption::Wait => {
                self.queue.suspend(job.id());
                self.publish(SchedulerEventPayload::JobSuspended { job_id: job.id() });
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
