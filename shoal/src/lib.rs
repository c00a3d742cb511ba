//! Shoal - per-process job scheduling for modular servers.
//!
//! Every component of a server ("module") runs its named units of work
//! ("jobs") through shoal: a per-module priority queue with a concurrency
//! ceiling, parent/child coordination that frees a parent's slot while it
//! waits on children, rate-limited progress reporting and a lifecycle state
//! machine that gates whether a module's queue admits work at all.
//!
//! # Core Concepts
//!
//! - **Job**: a unit of work with identity, payload, status, optional parent
//!   and children, and a result slot. See [`Job`] and [`JobRequest`].
//!
//! - **Queue**: the per-module [`Queue`] orders pending tasks by priority
//!   (lowest first, newest first on ties), enforces the concurrency ceiling
//!   and honours the pause flag. Priority [`BYPASS_PRIORITY`] skips both.
//!
//! - **Module**: a [`Module`] owns a queue, a table of [`JobHandler`]s,
//!   per-job [`JobStatistics`] and a [`ModuleStatus`].
//!
//! - **Manager**: the [`ModuleManager`] registers modules, starts them in
//!   registration order and can force a global lockdown. Its [`JobManager`]
//!   indexes in-flight and long-lived jobs for inspection.
//!
//! - **Operator**: [`Operator`] exposes lockdown, status, statistics, job
//!   inspection and ad-hoc submission as JSON-lines commands.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use shoal::*;
//!
//! let manager = ModuleManager::new(ShoalConfig::load(None)?);
//! let db = manager.register(
//!     ModuleBuilder::new("db")
//!         .with_concurrency(4)
//!         .with_job("vacuum", handler_fn(|ctx, payload| async move {
//!             ctx.progress(ProgressEvent::update("starting"));
//!             Ok(json!({ "vacuumed": payload["table"] }))
//!         })),
//! )?;
//! manager.start_all().await?;
//!
//! let value = db
//!     .run_job(JobRequest::new("vacuum").with_payload(json!({ "table": "users" })))
//!     .await?;
//! ```

/// Scheduler configuration.
///
/// The `config` module defines [`ShoalConfig`], loaded with figment from
/// defaults, TOML and `SHOAL_` environment variables, together with
/// [`ModuleDefaults`] and per-module [`ModuleOverrides`].
pub mod config;

/// Error types.
///
/// [`JobError`] is what a rejected job resolves with; [`SchedulerError`]
/// covers registration, lifecycle, configuration and operator failures.
pub mod error;

/// Lifecycle event bus.
///
/// [`EventBus`] broadcasts [`SchedulerEvent`]s (job queued, started,
/// suspended, requeued, resumed, finished and module status changes).
pub mod events;

/// Job handler traits and closure adapters.
///
/// - [`JobHandler`] and [`handler_fn`] for job bodies
/// - [`JobGuard`] for permission checks before guarded jobs
/// - [`ModuleInitializer`] and [`initializer_fn`] for startup hooks
pub mod handler;

/// Jobs and their result plumbing.
///
/// - [`Job`] - a unit of work and its place in a job tree
/// - [`JobId`], [`JobStatus`], [`JobResult`], [`JobOutcome`]
/// - [`JobRequest`] - what callers submit
/// - [`JobCompletion`] - future resolving with the job's value
/// - [`JobTree`] - serializable snapshot of a job and its descendants
pub mod job;

/// Secondary index of in-flight and long-lived jobs.
pub mod job_manager;

/// Module registry, startup sequencing and lockdown.
///
/// Provides [`ModuleManager`] and [`JobInspection`].
pub mod manager;

/// Prometheus collectors, available with the `metrics` feature.
#[cfg(feature = "metrics")]
pub mod metrics;

/// Modules, their builder and the context handed to job bodies.
///
/// - [`Module`] - queue, handlers, statistics and lifecycle status
/// - [`ModuleBuilder`] - declares jobs, priorities, guard and initializer
/// - [`JobContext`] - lets a job body spawn children and report progress
/// - [`ModuleReport`] - status and queue depths for operators
pub mod module;

/// Operator command surface.
pub mod operator;

/// Progress events, listeners and debouncing.
pub mod progress;

/// Per-module priority queue.
///
/// [`Queue`] holds pending, running and suspended [`Task`]s and admits them
/// through a [`TaskExecutor`]. [`QueueSnapshot`] reports its depths.
pub mod queue;

/// Per-job-name counters and running mean durations.
pub mod statistics;

/// Module lifecycle states.
pub mod status;

/// Tracing spans and metric helpers.
pub mod telemetry;

pub use config::*;
pub use error::{JobError, SchedulerError};
pub use events::*;
pub use handler::*;
pub use job::*;
pub use job_manager::*;
pub use manager::*;
pub use module::*;
pub use operator::*;
pub use progress::*;
pub use queue::*;
pub use statistics::*;
pub use status::*;
