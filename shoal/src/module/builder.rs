use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Module, ModuleInner};
use crate::config::{ModuleDefaults, ModuleOverrides};
use crate::error::{Result, SchedulerError};
use crate::events::EventBus;
use crate::handler::{JobGuard, JobHandler, ModuleInitializer};
use crate::job_manager::JobManager;
use crate::manager::ManagerInner;
use crate::queue::{Queue, TaskExecutor};
use crate::statistics::ModuleStatistics;
use crate::status::ModuleStatus;

/// Shared pieces a manager hands to every module it registers.
pub(crate) struct Wiring {
    pub jobs: Arc<JobManager>,
    pub events: EventBus,
    pub manager: Weak<ManagerInner>,
    pub defaults: ModuleDefaults,
    pub overrides: Option<ModuleOverrides>,
}

impl Default for Wiring {
    fn default() -> Self {
        Self {
            jobs: Arc::new(JobManager::new()),
            events: EventBus::default(),
            manager: Weak::new(),
            defaults: ModuleDefaults::default(),
            overrides: None,
        }
    }
}

/// Builder for a [`Module`].
///
/// Values left unset fall back to the manager's configured defaults.
/// Per-module configuration overrides win over values set here.
///
/// ```ignore
/// let module = ModuleBuilder::new("db")
///     .with_concurrency(4)
///     .with_priority("vacuum", 50)
///     .with_job("vacuum", handler_fn(|_ctx, _payload| async { Ok(Value::Null) }))
///     .with_initializer(initializer_fn(|_module| async { Ok(()) }));
/// let module = manager.register(module)?;
/// ```
pub struct ModuleBuilder {
    name: String,
    concurrency: Option<usize>,
    default_priority: Option<i32>,
    progress_interval: Option<Duration>,
    initialize_timeout: Option<Duration>,
    priorities: HashMap<String, i32>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    duplicate: Option<String>,
    guard: Option<Arc<dyn JobGuard>>,
    initializer: Option<Arc<dyn ModuleInitializer>>,
}

impl fmt::Debug for ModuleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut jobs: Vec<&String> = self.handlers.keys().collect();
        jobs.sort();
        f.debug_struct("ModuleBuilder")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("default_priority", &self.default_priority)
            .field("priorities", &self.priorities)
            .field("jobs", &jobs)
            .field("guard_set", &self.guard.is_some())
            .field("initializer_set", &self.initializer.is_some())
            .finish()
    }
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            default_priority: None,
            progress_interval: None,
            initialize_timeout: None,
            priorities: HashMap::new(),
            handlers: HashMap::new(),
            duplicate: None,
            guard: None,
            initializer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = Some(priority);
        self
    }

    /// Default priority for one job name.
    pub fn with_priority(mut self, job: impl Into<String>, priority: i32) -> Self {
        self.priorities.insert(job.into(), priority);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    pub fn with_initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = Some(timeout);
        self
    }

    /// Register a handler. Registering the same name twice fails the build.
    pub fn with_job<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            tracing::debug!(
                module = %self.name,
                job = %name,
                handler = type_name::<H>(),
                "duplicate job registration"
            );
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: JobGuard,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn with_initializer<I>(mut self, initializer: I) -> Self
    where
        I: ModuleInitializer,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Build a module that is not registered with any manager.
    pub fn build(self) -> Result<Module> {
        self.build_with(Wiring::default())
    }

    pub(crate) fn build_with(self, wiring: Wiring) -> Result<Module> {
        if let Some(name) = self.duplicate {
            return Err(SchedulerError::JobExists {
                module: self.name,
                name,
            });
        }

        let defaults = wiring.defaults;
        let overrides = wiring.overrides.unwrap_or_default();
        let concurrency = overrides
            .concurrency
            .or(self.concurrency)
            .unwrap_or(defaults.concurrency);
        let mut priorities = self.priorities;
        priorities.extend(overrides.priorities);

        let name = self.name;
        let inner = Arc::new_cyclic(|weak: &Weak<ModuleInner>| {
            let executor: Weak<dyn TaskExecutor> = weak.clone();
            ModuleInner {
                queue: Queue::new(name.clone(), concurrency, executor),
                name,
                status: Mutex::new(ModuleStatus::Uninitialized),
                handlers: self.handlers,
                priorities,
                default_priority: self.default_priority.unwrap_or(defaults.default_priority),
                progress_interval: self
                    .progress_interval
                    .unwrap_or_else(|| defaults.progress_interval()),
                initialize_timeout: self
                    .initialize_timeout
                    .or_else(|| defaults.initialize_timeout()),
                guard: self.guard,
                initializer: self.initializer,
                statistics: ModuleStatistics::new(),
                consistency_violations: AtomicU64::new(0),
                jobs: wiring.jobs,
                events: wiring.events,
                manager: wiring.manager,
            }
        });
        Ok(Module::from_inner(inner))
    }
}
