use std::time::Duration;

use shoal::{JobStatus, Module};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Poll `condition` until it holds or `timeout` passes. Returns whether it
/// held.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until `module` has `expected` tasks in its running set.
pub async fn wait_for_running(module: &Module, expected: usize) -> bool {
    eventually(Duration::from_secs(2), || module.queue().snapshot().running == expected).await
}

/// Wait until `module` has `expected` suspended parents.
pub async fn wait_for_suspended(module: &Module, expected: usize) -> bool {
    eventually(Duration::from_secs(2), || module.queue().snapshot().suspended == expected).await
}

/// Wait until every tracked job on `module` with `name` reaches `status`.
pub async fn wait_for_status(module: &Module, name: &str, status: JobStatus) -> bool {
    eventually(Duration::from_secs(2), || {
        let jobs: Vec<_> = module
            .jobs()
            .jobs_for(module.name())
            .into_iter()
            .filter(|job| job.name() == name)
            .collect();
        !jobs.is_empty() && jobs.iter().all(|job| job.status() == status)
    })
    .await
}
