//! Tracing spans and metric helpers for the scheduler.
//!
//! Every `record_*`/`set_*` helper logs through `tracing` and, with the
//! `metrics` feature enabled, also updates the Prometheus collectors in
//! [`crate::metrics`].

use std::future::Future;

use tracing::{Instrument, Span, info_span};

/// Span covering one run of a job body.
#[must_use]
pub fn job_execute_span(module: &str, job: &str, job_id: impl std::fmt::Display) -> Span {
    info_span!(
        "shoal.execute",
        module = %module,
        job = %job,
        job_id = %job_id,
    )
}

/// Span covering delivery of child results to a readmitted parent.
#[must_use]
pub fn job_deliver_span(module: &str, job_id: impl std::fmt::Display, children: usize) -> Span {
    info_span!(
        "shoal.deliver",
        module = %module,
        job_id = %job_id,
        children = children,
    )
}

/// Span covering a module's initializer.
#[must_use]
pub fn module_initialize_span(module: &str) -> Span {
    info_span!("shoal.initialize", module = %module)
}

/// Attach an execute span to `future`.
pub fn instrument_execute<F>(
    module: &str,
    job: &str,
    job_id: impl std::fmt::Display,
    future: F,
) -> tracing::instrument::Instrumented<F>
where
    F: Future,
{
    future.instrument(job_execute_span(module, job, job_id))
}

pub fn record_job_enqueued(module: &str, job: &str, priority: i32) {
    tracing::debug!(module = %module, job = %job, priority, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(module, job);
}

pub fn record_job_completed(module: &str, job: &str, status: &str) {
    tracing::debug!(module = %module, job = %job, status = %status, "job completed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(module, job, status);
}

pub fn observe_job_duration(module: &str, job: &str, status: &str, duration_secs: f64) {
    tracing::trace!(
        module = %module,
        job = %job,
        status = %status,
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(module, job, status, duration_secs);
}

/// A child finished while its parent was not waiting on children.
pub fn record_consistency_violation(module: &str, parent_status: &str) {
    tracing::debug!(
        module = %module,
        parent_status = %parent_status,
        "consistency violation recorded"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_consistency_violation(module);
}

/// Update the depth gauge for one of a queue's sets (`pending`, `running`,
/// `suspended`).
pub fn set_queue_depth(module: &str, state: &str, depth: usize) {
    tracing::trace!(module = %module, state = %state, depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(module, state, depth as f64);
}
