use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::queue::DEFAULT_CONCURRENCY;

/// Priority used when neither the caller nor the module names one.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Top-level scheduler configuration.
///
/// Loaded by [`ShoalConfig::load`] from built-in defaults, an optional TOML
/// file and `SHOAL_` environment variables, in that order. Nested keys are
/// separated by `__` in the environment, e.g.
/// `SHOAL_MODULES__DB__CONCURRENCY=4`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    /// Values applied to every module unless overridden.
    pub defaults: ModuleDefaults,
    /// Per-module overrides keyed by module name.
    pub modules: HashMap<String, ModuleOverrides>,
    /// Buffer size of the lifecycle event bus.
    pub event_capacity: usize,
}

impl Default for ShoalConfig {
    fn default() -> Self {
        Self {
            defaults: ModuleDefaults::default(),
            modules: HashMap::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ShoalConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ShoalConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(Env::prefixed("SHOAL_").split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment
            .extract()
            .map_err(|e| SchedulerError::Config(e.to_string()))
    }

    pub fn overrides(&self, module: &str) -> Option<&ModuleOverrides> {
        self.modules.get(module)
    }
}

/// Defaults for module construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleDefaults {
    /// Regular tasks a module runs at once.
    pub concurrency: usize,
    /// Priority for jobs without an explicit or per-name priority.
    pub default_priority: i32,
    /// Debounce window for progress `update` events, in milliseconds.
    pub progress_interval_ms: u64,
    /// Upper bound on a module's initializer, in milliseconds.
    pub initialize_timeout_ms: Option<u64>,
}

impl Default for ModuleDefaults {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            default_priority: DEFAULT_PRIORITY,
            progress_interval_ms: 1000,
            initialize_timeout_ms: None,
        }
    }
}

impl ModuleDefaults {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn initialize_timeout(&self) -> Option<Duration> {
        self.initialize_timeout_ms.map(Duration::from_millis)
    }
}

/// Operator-supplied overrides for one module. These win over values set
/// in code.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleOverrides {
    pub concurrency: Option<usize>,
    /// Default priority per job name.
    pub priorities: HashMap<String, i32>,
}
