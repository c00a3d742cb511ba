//! Prometheus metrics for the scheduler, behind the `metrics` feature.
//!
//! ## Counters
//! - `shoal_jobs_enqueued_total` - jobs pushed onto a queue
//! - `shoal_jobs_completed_total` - jobs settled, by outcome
//! - `shoal_consistency_violations_total` - children finishing under a parent that was not waiting
//!
//! ## Gauges
//! - `shoal_queue_depth` - tasks per queue set
//!
//! ## Histograms
//! - `shoal_job_duration_seconds` - job body duration
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `module`, `job`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("shoal_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["module", "job"])
        .expect("shoal_jobs_enqueued_total metric creation failed")
});

/// Labels: `module`, `job`, `status` (`resolved` or `rejected`).
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("shoal_jobs_completed_total", "Total number of jobs completed");
    CounterVec::new(opts, &["module", "job", "status"])
        .expect("shoal_jobs_completed_total metric creation failed")
});

/// Labels: `module`.
pub static CONSISTENCY_VIOLATIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "shoal_consistency_violations_total",
        "Children that finished while their parent was not waiting on them",
    );
    CounterVec::new(opts, &["module"])
        .expect("shoal_consistency_violations_total metric creation failed")
});

/// Labels: `module`, `state` (`pending`, `running`, `suspended`).
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("shoal_queue_depth", "Current number of tasks per queue set");
    GaugeVec::new(opts, &["module", "state"]).expect("shoal_queue_depth metric creation failed")
});

/// Labels: `module`, `job`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "shoal_job_duration_seconds",
        "Job body duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["module", "job", "status"])
        .expect("shoal_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(CONSISTENCY_VIOLATIONS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(module: &str, job: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[module, job]).inc();
}

pub fn record_job_completed(module: &str, job: &str, status: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[module, job, status])
        .inc();
}

pub fn record_consistency_violation(module: &str) {
    CONSISTENCY_VIOLATIONS_TOTAL.with_label_values(&[module]).inc();
}

pub fn set_queue_depth(module: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[module, state]).set(depth);
}

pub fn observe_job_duration(module: &str, job: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[module, job, status])
        .observe(duration_secs);
}

/// Encode everything in [`REGISTRY`] in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
