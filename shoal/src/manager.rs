use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ShoalConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, SchedulerEvent};
use crate::job::{Job, JobId, JobTree};
use crate::job_manager::JobManager;
use crate::module::{Module, ModuleBuilder, ModuleReport, Wiring};
use crate::statistics::JobStatistics;
use crate::status::ModuleStatus;

/// Owns every module, sequences their startup and can lock them all down.
///
/// Cheap to clone. Modules hold only a weak reference back to the manager,
/// so dropping the last manager handle drops the modules.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    config: ShoalConfig,
    modules: RwLock<Vec<Module>>,
    lockdown: AtomicBool,
    jobs: Arc<JobManager>,
    events: EventBus,
}

/// A job located by id, shown inside the tree of its root job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobInspection {
    pub job_id: JobId,
    pub root_id: JobId,
    pub tree: JobTree,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new(ShoalConfig::default())
    }
}

impl ModuleManager {
    pub fn new(config: ShoalConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                modules: RwLock::new(Vec::new()),
                lockdown: AtomicBool::new(false),
                jobs: Arc::new(JobManager::new()),
                events,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ShoalConfig {
        &self.inner.config
    }

    /// Build and register a module. Startup order follows registration order.
    pub fn register(&self, builder: ModuleBuilder) -> Result<Module> {
        let name = builder.name().to_string();
        let mut modules = self.inner.modules.write();
        if self.is_locked_down() {
            return Err(SchedulerError::Lockdown);
        }
        if modules.iter().any(|module| module.name() == name) {
            return Err(SchedulerError::ModuleExists(name));
        }

        let module = builder.build_with(Wiring {
            jobs: Arc::clone(&self.inner.jobs),
            events: self.inner.events.clone(),
            manager: Arc::downgrade(&self.inner),
            defaults: self.inner.config.defaults.clone(),
            overrides: self.inner.config.overrides(&name).cloned(),
        })?;
        tracing::info!(
            module = %name,
            concurrency = module.concurrency(),
            jobs = ?module.job_names(),
            "module registered"
        );
        modules.push(module.clone());
        Ok(module)
    }

    pub fn module(&self, name: &str) -> Option<Module> {
        self.inner
            .modules
            .read()
            .iter()
            .find(|module| module.name() == name)
            .cloned()
    }

    /// Registered modules in registration order.
    pub fn modules(&self) -> Vec<Module> {
        self.inner.modules.read().clone()
    }

    /// Initialize every uninitialized module, one at a time, in
    /// registration order.
    ///
    /// A module whose initializer fails is left `FAILED` and startup moves
    /// on. Stops with [`SchedulerError::Lockdown`] once lockdown is engaged.
    pub async fn start_all(&self) -> Result<()> {
        for module in self.modules() {
            if self.is_locked_down() {
                tracing::warn!(module = %module.name(), "startup stopped by lockdown");
                return Err(SchedulerError::Lockdown);
            }
            if module.status() != ModuleStatus::Uninitialized {
                tracing::debug!(
                    module = %module.name(),
                    status = %module.status(),
                    "skipping module"
                );
                continue;
            }
            match module.initialize().await {
                Ok(()) => tracing::info!(module = %module.name(), "module ready"),
                Err(SchedulerError::Lockdown) => return Err(SchedulerError::Lockdown),
                Err(err) => {
                    tracing::warn!(module = %module.name(), error = %err, "module failed to start")
                }
            }
        }
        Ok(())
    }

    /// Force every module into `LOCKDOWN`. Irreversible.
    pub fn lockdown_all(&self) {
        self.inner.lockdown.store(true, Ordering::SeqCst);
        tracing::warn!("lockdown engaged");
        for module in self.modules() {
            module.set_status(ModuleStatus::Lockdown);
        }
    }

    pub fn is_locked_down(&self) -> bool {
        self.inner.lockdown.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.inner.jobs
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn find_job(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.jobs.find_job(id)
    }

    /// Locate a tracked job and return the whole tree it belongs to.
    pub fn inspect(&self, id: JobId) -> Result<JobInspection> {
        let job = self.find_job(id).ok_or(SchedulerError::JobNotFound(id))?;
        let root = job.root();
        Ok(JobInspection {
            job_id: id,
            root_id: root.id(),
            tree: root.tree(),
        })
    }

    pub fn reports(&self) -> Vec<ModuleReport> {
        self.modules().iter().map(Module::report).collect()
    }

    pub fn statistics(&self) -> BTreeMap<String, BTreeMap<String, JobStatistics>> {
        self.modules()
            .iter()
            .map(|module| (module.name().to_string(), module.statistics()))
            .collect()
    }

    pub fn module_statistics(&self, name: &str) -> Result<BTreeMap<String, JobStatistics>> {
        self.module(name)
            .map(|module| module.statistics())
            .ok_or_else(|| SchedulerError::ModuleNotFound(name.to_string()))
    }

    /// Sum of consistency violations across modules.
    pub fn consistency_violations(&self) -> u64 {
        self.modules()
            .iter()
            .map(Module::consistency_violations)
            .sum()
    }
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .inner
            .modules
            .try_read()
            .map(|modules| modules.iter().map(|m| m.name().to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("ModuleManager")
            .field("modules", &names)
            .field("lockdown", &self.is_locked_down())
            .field("tracked_jobs", &self.inner.jobs.len())
            .field("events", &self.inner.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleOverrides;
    use crate::handler::handler_fn;
    use serde_json::Value;

    fn builder(name: &str) -> ModuleBuilder {
        ModuleBuilder::new(name).with_job(
            "noop",
            handler_fn(|_ctx, _payload| async { Ok(Value::Null) }),
        )
    }

    #[test]
    fn duplicate_modules_are_rejected() {
        let manager = ModuleManager::default();
        manager.register(builder("db")).unwrap();
        assert!(matches!(
            manager.register(builder("db")),
            Err(SchedulerError::ModuleExists(name)) if name == "db"
        ));
    }

    #[test]
    fn registration_applies_configuration() {
        let mut config = ShoalConfig::default();
        config.defaults.concurrency = 4;
        config.modules.insert(
            "cache".into(),
            ModuleOverrides {
                concurrency: Some(1),
                ..Default::default()
            },
        );
        let manager = ModuleManager::new(config);

        let db = manager.register(builder("db")).unwrap();
        let cache = manager.register(builder("cache").with_concurrency(9)).unwrap();
        assert_eq!(db.concurrency(), 4);
        assert_eq!(cache.concurrency(), 1);
        assert!(cache.manager().is_some());
    }

    #[test]
    fn lockdown_blocks_registration() {
        let manager = ModuleManager::default();
        let db = manager.register(builder("db")).unwrap();
        manager.lockdown_all();

        assert_eq!(db.status(), ModuleStatus::Lockdown);
        assert!(matches!(
            manager.register(builder("late")),
            Err(SchedulerError::Lockdown)
        ));
    }

    #[tokio::test]
    async fn start_all_readies_modules_in_order() {
        let manager = ModuleManager::default();
        manager.register(builder("a")).unwrap();
        manager.register(builder("b")).unwrap();
        let mut events = manager.subscribe();

        manager.start_all().await.unwrap();
        let ready: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| {
                matches!(
                    event.payload,
                    crate::events::SchedulerEventPayload::StatusChanged {
                        to: ModuleStatus::Ready,
                        ..
                    }
                )
            })
            .map(|event| event.module)
            .collect();
        assert_eq!(ready, ["a", "b"]);
    }

    #[test]
    fn missing_module_statistics() {
        let manager = ModuleManager::default();
        assert!(matches!(
            manager.module_statistics("ghost"),
            Err(SchedulerError::ModuleNotFound(_))
        ));
        assert!(matches!(
            manager.inspect(JobId::new()),
            Err(SchedulerError::JobNotFound(_))
        ));
    }
}
