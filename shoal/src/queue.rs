use std::cmp::Reverse;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, JobStatus};
use crate::telemetry;

/// Tasks with this priority ignore both the pause flag and the
/// concurrency ceiling.
pub const BYPASS_PRIORITY: i32 = -1;

/// Default number of regular tasks a queue runs at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Scheduling wrapper around a [`Job`].
#[derive(Clone, Debug)]
pub struct Task {
    job: Arc<Job>,
    priority: i32,
    seq: u64,
    resumed: bool,
    enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_bypass(&self) -> bool {
        self.priority == BYPASS_PRIORITY
    }

    /// True when the task came back from suspension.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Smallest rank is started first. Bypass tasks lead, then resumed
    /// tasks, then everything else by priority. Later sequence numbers win
    /// ties.
    fn rank(&self) -> (u8, i32, Reverse<u64>) {
        if self.is_bypass() {
            (0, 0, Reverse(self.seq))
        } else if self.resumed {
            (1, 0, Reverse(self.seq))
        } else {
            (2, self.priority, Reverse(self.seq))
        }
    }
}

/// Receives tasks the queue has admitted.
///
/// Called without any queue lock held, so implementations may call back
/// into the queue.
pub trait TaskExecutor: Send + Sync {
    fn start(self: Arc<Self>, task: Task);
}

/// Point-in-time view of a queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub module: String,
    pub sampled_at: DateTime<Utc>,
    pub concurrency: usize,
    pub paused: bool,
    pub pending: usize,
    pub running: usize,
    pub suspended: usize,
}

struct QueueState {
    pending: Vec<Task>,
    running: Vec<Task>,
    suspended: Vec<Task>,
    paused: bool,
    concurrency: usize,
    next_seq: u64,
    pumping: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn regular_running(&self) -> usize {
        self.running.iter().filter(|t| !t.is_bypass()).count()
    }

    fn admissible(&self, task: &Task) -> bool {
        task.is_bypass() || (!self.paused && self.regular_running() < self.concurrency)
    }

    /// Move every task that may start now from pending to running, in the
    /// order they should be started. Stops at the first inadmissible
    /// candidate.
    fn admit(&mut self) -> Vec<Task> {
        let mut admitted = Vec::new();
        loop {
            let best = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, task)| task.rank())
                .map(|(index, _)| index);
            let Some(index) = best else {
                break;
            };
            if !self.admissible(&self.pending[index]) {
                break;
            }
            let task = self.pending.swap_remove(index);
            self.running.push(task.clone());
            admitted.push(task);
        }
        admitted
    }

    fn take(list: &mut Vec<Task>, id: JobId) -> Option<Task> {
        let index = list.iter().position(|task| task.job.id() == id)?;
        Some(list.remove(index))
    }
}

/// Per-module priority queue with a concurrency ceiling and a pause flag.
///
/// Holds three sets: `pending` tasks waiting for admission, `running` tasks
/// that occupy a slot (bypass tasks excepted), and `suspended` tasks whose
/// job is waiting on children and holds no slot. Queues start paused.
pub struct Queue {
    module: String,
    executor: Weak<dyn TaskExecutor>,
    state: Mutex<QueueState>,
}

impl Queue {
    pub fn new(
        module: impl Into<String>,
        concurrency: usize,
        executor: Weak<dyn TaskExecutor>,
    ) -> Self {
        Self {
            module: module.into(),
            executor,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                running: Vec::new(),
                suspended: Vec::new(),
                paused: true,
                concurrency,
                next_seq: 0,
                pumping: false,
            }),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Wrap `job` in a task, mark it queued and run a scheduling pass.
    pub fn enqueue(&self, job: Arc<Job>, priority: i32) {
        job.set_status(JobStatus::Queued);
        {
            let mut state = self.state.lock();
            let seq = state.next_seq();
            tracing::debug!(
                module = %self.module,
                job = %job.name(),
                job_id = %job.id(),
                priority,
                "task enqueued"
            );
            state.pending.push(Task {
                job,
                priority,
                seq,
                resumed: false,
                enqueued_at: Utc::now(),
            });
        }
        self.schedule();
    }

    /// Stop admitting regular tasks. Running tasks are unaffected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.schedule();
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn concurrency(&self) -> usize {
        self.state.lock().concurrency
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        self.state.lock().concurrency = concurrency;
        self.schedule();
    }

    /// Move a running task to the suspended set, freeing its slot.
    pub fn suspend(&self, id: JobId) -> bool {
        let moved = self.hold(id);
        if moved {
            self.schedule();
        }
        moved
    }

    /// Like [`suspend`](Self::suspend) but without a scheduling pass, for
    /// callers that need to enqueue work before the freed slot is reused.
    pub(crate) fn hold(&self, id: JobId) -> bool {
        let mut state = self.state.lock();
        match QueueState::take(&mut state.running, id) {
            Some(task) => {
                state.suspended.push(task);
                true
            }
            None => {
                tracing::warn!(
                    module = %self.module,
                    job_id = %id,
                    "suspend of a task that is not running"
                );
                false
            }
        }
    }

    /// Put a suspended task back at the front of the pending set.
    pub fn unsuspend(&self, id: JobId) -> bool {
        {
            let mut state = self.state.lock();
            let Some(mut task) = QueueState::take(&mut state.suspended, id) else {
                tracing::warn!(
                    module = %self.module,
                    job_id = %id,
                    "unsuspend of a task that is not suspended"
                );
                return false;
            };
            task.resumed = true;
            task.seq = state.next_seq();
            state.pending.push(task);
        }
        self.schedule();
        true
    }

    /// Drop a task whose job has finished and run a scheduling pass.
    pub fn finish(&self, id: JobId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            QueueState::take(&mut state.running, id)
                .or_else(|| QueueState::take(&mut state.suspended, id))
                .is_some()
        };
        self.schedule();
        removed
    }

    /// Start every admissible task.
    ///
    /// Re-entrant: a call made while another pass is starting tasks returns
    /// immediately and the running pass picks up the new state.
    pub fn schedule(&self) {
        let Some(executor) = self.executor.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        if state.pumping {
            return;
        }
        state.pumping = true;
        loop {
            let admitted = state.admit();
            if admitted.is_empty() {
                break;
            }
            MutexGuard::unlocked(&mut state, || {
                for task in admitted {
                    tracing::debug!(
                        module = %self.module,
                        job = %task.job.name(),
                        job_id = %task.job.id(),
                        priority = task.priority,
                        resumed = task.resumed,
                        "task admitted"
                    );
                    Arc::clone(&executor).start(task);
                }
            });
        }
        state.pumping = false;
        self.report_depth(&state);
    }

    fn report_depth(&self, state: &QueueState) {
        telemetry::set_queue_depth(&self.module, "pending", state.pending.len());
        telemetry::set_queue_depth(&self.module, "running", state.running.len());
        telemetry::set_queue_depth(&self.module, "suspended", state.suspended.len());
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            module: self.module.clone(),
            sampled_at: Utc::now(),
            concurrency: state.concurrency,
            paused: state.paused,
            pending: state.pending.len(),
            running: state.running.len(),
            suspended: state.suspended.len(),
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Queue");
        debug.field("module", &self.module);
        if let Some(state) = self.state.try_lock() {
            debug
                .field("paused", &state.paused)
                .field("concurrency", &state.concurrency)
                .field("pending", &state.pending.len())
                .field("running", &state.running.len())
                .field("suspended", &state.suspended.len());
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    /// Records start order and, when asked, suspends jobs named `suspend-*`
    /// from inside `start` to exercise re-entrancy.
    struct Recorder {
        started: Mutex<Vec<String>>,
        queue: Mutex<Weak<Queue>>,
    }

    impl TaskExecutor for Recorder {
        fn start(self: Arc<Self>, task: Task) {
            self.started.lock().push(task.job().name().to_string());
            if task.job().name().starts_with("suspend-") {
                if let Some(queue) = self.queue.lock().upgrade() {
                    queue.suspend(task.job().id());
                }
            }
        }
    }

    fn setup(concurrency: usize) -> (Arc<Recorder>, Arc<Queue>) {
        let recorder = Arc::new(Recorder {
            started: Mutex::new(Vec::new()),
            queue: Mutex::new(Weak::new()),
        });
        let executor: Weak<dyn TaskExecutor> = Arc::downgrade(&recorder) as Weak<dyn TaskExecutor>;
        let queue = Arc::new(Queue::new("test", concurrency, executor));
        *recorder.queue.lock() = Arc::downgrade(&queue);
        (recorder, queue)
    }

    fn job(name: &str, priority: i32) -> Arc<Job> {
        Job::new(JobSpec::detached(name, priority)).0
    }

    fn started(recorder: &Recorder) -> Vec<String> {
        recorder.started.lock().clone()
    }

    #[test]
    fn starts_paused() {
        let (recorder, queue) = setup(4);
        queue.enqueue(job("a", 1), 1);
        assert!(started(&recorder).is_empty());
        assert_eq!(queue.snapshot().pending, 1);
        assert!(queue.snapshot().paused);
    }

    #[test]
    fn starts_in_priority_order() {
        let (recorder, queue) = setup(10);
        queue.enqueue(job("p3", 3), 3);
        queue.enqueue(job("p1", 1), 1);
        queue.enqueue(job("p7", 7), 7);
        queue.enqueue(job("p2", 2), 2);
        queue.resume();
        assert_eq!(started(&recorder), ["p1", "p2", "p3", "p7"]);
    }

    #[test]
    fn equal_priority_is_lifo() {
        let (recorder, queue) = setup(1);
        let blocker = job("blocker", 0);
        queue.resume();
        queue.enqueue(blocker.clone(), 0);
        queue.enqueue(job("t1", 5), 5);
        queue.enqueue(job("t2", 5), 5);
        queue.finish(blocker.id());
        assert_eq!(started(&recorder), ["blocker", "t2"]);
    }

    #[test]
    fn ceiling_holds_regular_tasks() {
        let (recorder, queue) = setup(2);
        queue.resume();
        for name in ["a", "b", "c", "d"] {
            queue.enqueue(job(name, 5), 5);
        }
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running, 2);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(started(&recorder).len(), 2);
    }

    #[test]
    fn bypass_ignores_ceiling_and_pause() {
        let (recorder, queue) = setup(1);
        queue.resume();
        queue.enqueue(job("regular", 5), 5);
        queue.pause();
        queue.enqueue(job("bypass", BYPASS_PRIORITY), BYPASS_PRIORITY);
        queue.enqueue(job("waiting", 5), 5);

        assert_eq!(started(&recorder), ["regular", "bypass"]);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running, 2);
        assert_eq!(snapshot.pending, 1);
    }

    #[test]
    fn bypass_does_not_consume_regular_slots() {
        let (recorder, queue) = setup(1);
        queue.enqueue(job("bypass", BYPASS_PRIORITY), BYPASS_PRIORITY);
        queue.resume();
        queue.enqueue(job("regular", 5), 5);
        assert_eq!(started(&recorder), ["bypass", "regular"]);
    }

    #[test]
    fn pause_keeps_running_tasks() {
        let (recorder, queue) = setup(2);
        let running = job("running", 5);
        queue.resume();
        queue.enqueue(running.clone(), 5);
        queue.pause();
        queue.enqueue(job("held", 5), 5);

        assert!(queue.finish(running.id()));
        assert_eq!(started(&recorder), ["running"]);

        queue.resume();
        assert_eq!(started(&recorder), ["running", "held"]);
    }

    #[test]
    fn suspend_frees_a_slot() {
        let (recorder, queue) = setup(1);
        queue.resume();
        queue.enqueue(job("suspend-parent", 5), 5);
        queue.enqueue(job("next", 5), 5);

        assert_eq!(started(&recorder), ["suspend-parent", "next"]);
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.suspended, 1);
    }

    #[test]
    fn unsuspended_task_goes_ahead_of_pending_work() {
        let (recorder, queue) = setup(1);
        let parent = job("suspend-parent", 5);
        let child = job("child", 1);
        queue.resume();
        queue.enqueue(parent.clone(), 5);
        queue.enqueue(child.clone(), 1);
        queue.enqueue(job("urgent", 0), 0);

        // The child holds the only slot; resume the parent before it leaves.
        assert!(queue.unsuspend(parent.id()));
        assert_eq!(queue.snapshot().pending, 2);
        queue.finish(child.id());

        // The recorder suspends the parent again, which lets `urgent` in.
        assert_eq!(
            started(&recorder),
            ["suspend-parent", "child", "suspend-parent", "urgent"]
        );
    }

    #[test]
    fn finish_removes_suspended_tasks() {
        let (_recorder, queue) = setup(1);
        let parent = job("suspend-parent", 5);
        queue.resume();
        queue.enqueue(parent.clone(), 5);
        assert_eq!(queue.snapshot().suspended, 1);
        assert!(queue.finish(parent.id()));
        assert_eq!(queue.snapshot().suspended, 0);
        assert!(!queue.finish(parent.id()));
    }

    #[test]
    fn raising_concurrency_admits_more() {
        let (recorder, queue) = setup(1);
        queue.resume();
        for name in ["a", "b", "c"] {
            queue.enqueue(job(name, 5), 5);
        }
        assert_eq!(started(&recorder).len(), 1);
        queue.set_concurrency(3);
        assert_eq!(started(&recorder).len(), 3);
        assert_eq!(queue.concurrency(), 3);
    }

    #[test]
    fn enqueue_marks_job_queued() {
        let (_recorder, queue) = setup(1);
        let pending = job("pending", 5);
        queue.enqueue(pending.clone(), 5);
        assert_eq!(pending.status(), JobStatus::Queued);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let (_recorder, queue) = setup(1);
        let stranger = JobId::new();
        assert!(!queue.suspend(stranger));
        assert!(!queue.unsuspend(stranger));
    }
}
