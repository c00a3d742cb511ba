use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::module::{JobContext, Module};

/// A named job implementation registered on a module.
///
/// Returning an error rejects the job; panics are caught by the executor
/// and reported the same way.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value>;
}

/// Adapter that turns an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
///
/// ```ignore
/// let echo = handler_fn(|_ctx, payload| async move { Ok(payload) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext, payload: Value) -> anyhow::Result<Value> {
        (self.f)(ctx, payload).await
    }
}

/// Permission check run before guarded jobs.
///
/// The check may itself run jobs (through the context) on this or other
/// modules. An error rejects the job with [`JobError::Denied`](crate::JobError::Denied).
#[async_trait]
pub trait JobGuard: Send + Sync + 'static {
    /// Whether `job` needs a check at all.
    fn guards(&self, _job: &str) -> bool {
        true
    }

    async fn check(&self, ctx: &JobContext) -> anyhow::Result<()>;
}

/// Startup hook awaited by [`Module::initialize`].
///
/// While it runs the module is `INITIALIZING` and its queue is paused, so
/// only jobs submitted with priority `-1` make progress.
#[async_trait]
pub trait ModuleInitializer: Send + Sync + 'static {
    async fn initialize(&self, module: &Module) -> anyhow::Result<()>;
}

pub struct FnInitializer<F> {
    f: F,
}

pub fn initializer_fn<F, Fut>(f: F) -> FnInitializer<F>
where
    F: Fn(Module) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnInitializer { f }
}

#[async_trait]
impl<F, Fut> ModuleInitializer for FnInitializer<F>
where
    F: Fn(Module) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn initialize(&self, module: &Module) -> anyhow::Result<()> {
        (self.f)(module.clone()).await
    }
}
