use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobId, JobStatus};

/// Index of in-flight and long-lived jobs, keyed by module name then job id.
///
/// Pure lookup: the scheduler never consults it to make decisions.
#[derive(Debug, Default)]
pub struct JobManager {
    modules: RwLock<HashMap<String, HashMap<JobId, Arc<Job>>>>,
}

impl JobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&self, module: &str, job: Arc<Job>) {
        self.modules
            .write()
            .entry(module.to_string())
            .or_default()
            .insert(job.id(), job);
    }

    pub fn remove_job(&self, module: &str, id: JobId) -> Option<Arc<Job>> {
        let mut modules = self.modules.write();
        let jobs = modules.get_mut(module)?;
        let removed = jobs.remove(&id);
        if jobs.is_empty() {
            modules.remove(module);
        }
        removed
    }

    pub fn get_job(&self, module: &str, id: JobId) -> Option<Arc<Job>> {
        self.modules.read().get(module)?.get(&id).cloned()
    }

    /// Look a job up without knowing its module.
    pub fn find_job(&self, id: JobId) -> Option<Arc<Job>> {
        self.modules
            .read()
            .values()
            .find_map(|jobs| jobs.get(&id).cloned())
    }

    pub fn jobs_for(&self, module: &str) -> Vec<Arc<Job>> {
        self.modules
            .read()
            .get(module)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.modules.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a finished long job from the index.
    pub fn release(&self, id: JobId) -> Result<Arc<Job>> {
        let job = self.find_job(id).ok_or(SchedulerError::JobNotFound(id))?;
        if job.status() != JobStatus::Finished {
            return Err(SchedulerError::JobActive(id));
        }
        job.set_long(false);
        self.remove_job(job.module(), id)
            .ok_or(SchedulerError::JobNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobResult, JobSpec};

    fn job(name: &str) -> Arc<Job> {
        Job::new(JobSpec::detached(name, 10)).0
    }

    #[test]
    fn add_find_remove() {
        let manager = JobManager::new();
        let a = job("a");
        let b = job("b");
        manager.add_job("db", a.clone());
        manager.add_job("cache", b.clone());

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get_job("db", a.id()).unwrap().id(), a.id());
        assert!(manager.get_job("cache", a.id()).is_none());
        assert_eq!(manager.find_job(b.id()).unwrap().name(), "b");
        assert_eq!(manager.jobs_for("db").len(), 1);

        assert!(manager.remove_job("db", a.id()).is_some());
        assert!(manager.remove_job("db", a.id()).is_none());
        assert!(manager.jobs_for("db").is_empty());
    }

    #[test]
    fn release_requires_finished_job() {
        let manager = JobManager::new();
        let long = job("report");
        long.set_long(true);
        manager.add_job("detached", long.clone());

        assert!(matches!(
            manager.release(long.id()),
            Err(SchedulerError::JobActive(_))
        ));

        long.finish(JobResult::Resolved(serde_json::Value::Null));
        let released = manager.release(long.id()).unwrap();
        assert!(!released.is_long());
        assert!(manager.is_empty());
        assert!(matches!(
            manager.release(long.id()),
            Err(SchedulerError::JobNotFound(_))
        ));
    }
}
