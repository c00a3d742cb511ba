use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Why a job did not resolve.
///
/// Stored in the job's result slot and handed to whoever awaits the job.
/// Never unwinds into the scheduler itself.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error("module `{module}` has no job named `{name}`")]
    UnknownJob { module: String, name: String },

    #[error("job failed: {0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("permission denied: {0}")]
    Denied(String),

    #[error("job result was dropped before delivery")]
    Abandoned,
}

/// Errors raised by module registration, lifecycle and operator commands.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("module `{0}` is already registered")]
    ModuleExists(String),

    #[error("module `{0}` is not registered")]
    ModuleNotFound(String),

    #[error("module `{module}` already defines a job named `{name}`")]
    JobExists { module: String, name: String },

    #[error("job {0} is not tracked")]
    JobNotFound(JobId),

    #[error("job {0} has not finished yet")]
    JobActive(JobId),

    #[error("scheduler is in lockdown")]
    Lockdown,

    #[error("module `{module}` failed to initialize: {reason}")]
    InitializeFailed { module: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
