use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a module.
///
/// Only `READY` lets regular work through the module's queue. `LOCKDOWN`
/// is terminal: once entered, every further transition is ignored.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Failed,
    Reconnecting,
    Lockdown,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Uninitialized => "UNINITIALIZED",
            ModuleStatus::Initializing => "INITIALIZING",
            ModuleStatus::Ready => "READY",
            ModuleStatus::Failed => "FAILED",
            ModuleStatus::Reconnecting => "RECONNECTING",
            ModuleStatus::Lockdown => "LOCKDOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleStatus::Lockdown)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
