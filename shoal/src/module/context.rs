use std::sync::Arc;

use super::Module;
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobCompletion, JobId, JobRequest};
use crate::progress::ProgressEvent;

/// Handed to every job body: the job being run and the module running it.
#[derive(Clone, Debug)]
pub struct JobContext {
    job: Arc<Job>,
    module: Module,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Job>, module: Module) -> Self {
        Self { job, module }
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Run a child job on this job's module.
    ///
    /// This job gives up its concurrency slot until every child it has
    /// spawned is finished; awaiting the returned completion resumes the
    /// body once the scheduler readmits it.
    pub fn run_child(&self, request: JobRequest) -> JobCompletion {
        self.module.run_job(request.with_parent(&self.job))
    }

    /// Run a child job on another module registered with the same manager.
    pub fn run_child_on(&self, module: &str, request: JobRequest) -> Result<JobCompletion> {
        let sibling = self.sibling(module)?;
        Ok(sibling.run_job(request.with_parent(&self.job)))
    }

    /// Look up another module registered with the same manager.
    pub fn sibling(&self, name: &str) -> Result<Module> {
        self.module
            .manager()
            .and_then(|manager| manager.module(name))
            .ok_or_else(|| SchedulerError::ModuleNotFound(name.to_string()))
    }

    pub fn progress(&self, event: ProgressEvent) {
        self.job.report_progress(event);
    }
}
