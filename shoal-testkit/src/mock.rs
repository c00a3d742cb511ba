use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shoal::{JobContext, JobId, Module, ModuleInitializer, ProgressEvent, ProgressListener};
use tokio::time::Instant;

/// Shared, ordered record of job bodies as they start.
#[derive(Clone, Debug, Default)]
pub struct ExecutionLog {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub module: String,
    pub name: String,
    pub payload: Value,
}

impl ExecutionRecord {
    /// `payload["label"]` if present, otherwise the job name.
    pub fn label(&self) -> String {
        self.payload["label"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.name.clone())
    }
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ctx: &JobContext, payload: &Value) {
        self.records.lock().push(ExecutionRecord {
            job_id: ctx.job_id(),
            module: ctx.module().name().to_string(),
            name: ctx.job().name().to_string(),
            payload: payload.clone(),
        });
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    /// Labels in start order. See [`ExecutionRecord::label`].
    pub fn labels(&self) -> Vec<String> {
        self.records.lock().iter().map(ExecutionRecord::label).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn assert_count_eq(&self, expected: usize) {
        let actual = self.len();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

/// Progress listener that keeps every event with the (tokio) time it arrived.
#[derive(Clone, Debug, Default)]
pub struct ProgressRecorder {
    events: Arc<Mutex<Vec<ProgressRecord>>>,
}

#[derive(Clone, Debug)]
pub struct ProgressRecord {
    pub job_id: JobId,
    pub event: ProgressEvent,
    pub at: Instant,
}

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProgressRecord> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|record| record.event.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn listener(&self) -> Arc<dyn ProgressListener> {
        Arc::new(self.clone())
    }
}

impl ProgressListener for ProgressRecorder {
    fn on_progress(&self, job_id: JobId, event: &ProgressEvent) {
        self.events.lock().push(ProgressRecord {
            job_id,
            event: event.clone(),
            at: Instant::now(),
        });
    }
}

/// Initializer with a scripted outcome that records the order modules were
/// initialized in.
#[derive(Clone, Debug)]
pub struct MockInitializer {
    order: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
    error: Option<String>,
}

impl MockInitializer {
    pub fn new() -> Self {
        Self {
            order: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            error: None,
        }
    }

    /// Share `order` with other initializers to observe startup order.
    pub fn sharing(order: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            order: Arc::clone(order),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }
}

impl Default for MockInitializer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleInitializer for MockInitializer {
    async fn initialize(&self, module: &Module) -> anyhow::Result<()> {
        self.order.lock().push(module.name().to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(error) => Err(anyhow::anyhow!("{error}")),
            None => Ok(()),
        }
    }
}
