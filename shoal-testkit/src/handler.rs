use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use shoal::{JobContext, JobHandler};
use tokio::sync::watch;

use crate::ExecutionLog;

/// Canned job bodies.
#[derive(Clone, Debug)]
pub enum TestHandler {
    /// Resolve with the payload.
    Echo,
    /// Sleep, then resolve with the payload.
    Slow { duration: Duration },
    /// Reject with `error`.
    Failing { error: String },
    /// Panic with `message`.
    Panicking { message: String },
    /// Block until the gate opens, then resolve with the payload.
    Gated { gate: Gate },
}

impl TestHandler {
    pub fn slow(duration: Duration) -> Self {
        TestHandler::Slow { duration }
    }

    pub fn failing(error: impl Into<String>) -> Self {
        TestHandler::Failing {
            error: error.into(),
        }
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        TestHandler::Panicking {
            message: message.into(),
        }
    }

    pub fn gated(gate: &Gate) -> Self {
        TestHandler::Gated { gate: gate.clone() }
    }

    /// Record every run in `log` before running this body.
    pub fn recorded(self, log: &ExecutionLog) -> Recorded {
        Recorded {
            inner: self,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    async fn run(&self, _ctx: JobContext, payload: Value) -> anyhow::Result<Value> {
        match self {
            TestHandler::Echo => Ok(payload),
            TestHandler::Slow { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(payload)
            }
            TestHandler::Failing { error } => Err(anyhow::anyhow!("{error}")),
            TestHandler::Panicking { message } => panic!("{message}"),
            TestHandler::Gated { gate } => {
                gate.wait().await;
                Ok(payload)
            }
        }
    }
}

/// A [`TestHandler`] that appends to an [`ExecutionLog`] when it starts.
#[derive(Clone, Debug)]
pub struct Recorded {
    inner: TestHandler,
    log: ExecutionLog,
}

#[async_trait]
impl JobHandler for Recorded {
    async fn run(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value> {
        self.log.push(&ctx, &payload);
        self.inner.run(ctx, payload).await
    }
}

/// Handler that spawns one child per entry of `payload["children"]` on its
/// own module, awaits them all and resolves with their values in order.
///
/// Each entry is `{"job": <name>, "payload": <value>}`.
pub fn fan_out() -> impl JobHandler {
    shoal::handler_fn(|ctx, payload| async move {
        let specs = payload["children"].as_array().cloned().unwrap_or_default();
        let completions: Vec<_> = specs
            .into_iter()
            .filter_map(|spec| {
                let job = spec["job"].as_str()?.to_string();
                let payload = spec["payload"].clone();
                Some(ctx.run_child(shoal::JobRequest::new(job).with_payload(payload)))
            })
            .collect();
        let mut values = Vec::with_capacity(completions.len());
        for completion in completions {
            values.push(completion.await?);
        }
        Ok(json!(values))
    })
}

/// One-shot latch shared between a test and the jobs it holds back.
#[derive(Clone, Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
