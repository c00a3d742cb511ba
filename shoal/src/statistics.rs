use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Counters and running mean duration for one job name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Jobs requested, including ones still queued.
    pub added: u64,
    pub successful: u64,
    pub failed: u64,
    /// Jobs that finished, successfully or not.
    pub total: u64,
    pub average_duration_ms: f64,
}

impl JobStatistics {
    /// Fold one finished run into the counters.
    ///
    /// The mean is updated incrementally (Welford), so it never needs the
    /// full history of durations.
    pub fn record(&mut self, duration_ms: f64, success: bool) {
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total += 1;
        self.average_duration_ms += (duration_ms - self.average_duration_ms) / self.total as f64;
    }
}

/// Per-module table of [`JobStatistics`] keyed by job name.
#[derive(Debug, Default)]
pub struct ModuleStatistics {
    jobs: Mutex<BTreeMap<String, JobStatistics>>,
}

impl ModuleStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_added(&self, job: &str) {
        self.jobs.lock().entry(job.to_string()).or_default().added += 1;
    }

    pub fn record(&self, job: &str, duration_ms: f64, success: bool) {
        self.jobs
            .lock()
            .entry(job.to_string())
            .or_default()
            .record(duration_ms, success);
    }

    pub fn get(&self, job: &str) -> Option<JobStatistics> {
        self.jobs.lock().get(job).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, JobStatistics> {
        self.jobs.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_three_durations() {
        let mut stats = JobStatistics::default();
        for duration in [10.0, 20.0, 30.0] {
            stats.record(duration, true);
        }
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.average_duration_ms, 20.0);
    }

    #[test]
    fn matches_incremental_formula_exactly() {
        let durations = [0.3, 7.25, 1e-3, 123.456, 42.0, 0.1];
        let mut stats = JobStatistics::default();
        let mut expected = 0.0f64;
        for (i, duration) in durations.iter().enumerate() {
            stats.record(*duration, i % 2 == 0);
            expected += (duration - expected) / (i + 1) as f64;
            assert_eq!(stats.average_duration_ms.to_bits(), expected.to_bits());
        }
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.failed, 3);
    }

    #[test]
    fn module_table_tracks_added_separately() {
        let table = ModuleStatistics::new();
        table.record_added("sync");
        table.record_added("sync");
        table.record("sync", 5.0, false);

        let stats = table.get("sync").unwrap();
        assert_eq!(stats.added, 2);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
        assert!(table.get("other").is_none());
        assert_eq!(table.snapshot().len(), 1);
    }
}
