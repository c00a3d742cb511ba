//! Module lifecycle: initialization, startup order, lockdown, guards and
//! failure handling in job bodies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use shoal::{
    BYPASS_PRIORITY, JobContext, JobError, JobGuard, JobId, JobRequest, ModuleBuilder,
    ModuleManager, ModuleStatus, ProgressEvent, SchedulerError, handler_fn, initializer_fn,
};
use shoal_testkit::{ExecutionLog, Gate, MockInitializer, TestHandler, wait_for_running};

#[tokio::test]
async fn start_all_initializes_in_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let manager = ModuleManager::default();
    for name in ["config", "db", "http"] {
        let initializer = MockInitializer::sharing(&order);
        let initializer = if name == "db" {
            initializer.failing("connection refused")
        } else {
            initializer
        };
        manager
            .register(
                ModuleBuilder::new(name)
                    .with_job("echo", TestHandler::Echo)
                    .with_initializer(initializer),
            )
            .unwrap();
    }

    manager.start_all().await.unwrap();

    assert_eq!(*order.lock(), ["config", "db", "http"]);
    let statuses: Vec<_> = manager.reports().into_iter().map(|r| (r.name, r.status)).collect();
    assert_eq!(
        statuses,
        [
            ("config".to_string(), ModuleStatus::Ready),
            ("db".to_string(), ModuleStatus::Failed),
            ("http".to_string(), ModuleStatus::Ready),
        ]
    );
}

#[tokio::test]
async fn failed_module_keeps_work_pending() {
    let manager = ModuleManager::default();
    let module = manager
        .register(
            ModuleBuilder::new("db")
                .with_job("echo", TestHandler::Echo)
                .with_initializer(MockInitializer::new().failing("no route to host")),
        )
        .unwrap();

    let err = module.initialize().await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::InitializeFailed { ref module, ref reason }
            if module == "db" && reason.contains("no route")
    ));
    assert_eq!(module.status(), ModuleStatus::Failed);

    let pending = module.run_job(JobRequest::new("echo"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(module.queue().is_paused());
    assert_eq!(module.queue().snapshot().pending, 1);

    // Reconnecting later and going ready drains the queue.
    assert!(module.set_status(ModuleStatus::Reconnecting));
    assert!(module.set_status(ModuleStatus::Ready));
    pending.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_initializer_times_out() {
    let manager = ModuleManager::default();
    let module = manager
        .register(
            ModuleBuilder::new("cache")
                .with_initialize_timeout(Duration::from_millis(100))
                .with_initializer(MockInitializer::new().with_delay(Duration::from_secs(30))),
        )
        .unwrap();

    let err = module.initialize().await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
    assert_eq!(module.status(), ModuleStatus::Failed);
}

#[tokio::test]
async fn bypass_jobs_run_during_initialization() {
    let manager = ModuleManager::default();
    let log = ExecutionLog::new();
    let module = manager
        .register(
            ModuleBuilder::new("db")
                .with_job("migrate", TestHandler::Echo.recorded(&log))
                .with_job("query", TestHandler::Echo.recorded(&log))
                .with_initializer(initializer_fn(|module| async move {
                    assert_eq!(module.status(), ModuleStatus::Initializing);
                    let _regular = module.run_job(JobRequest::new("query"));
                    module
                        .run_job(JobRequest::new("migrate").with_priority(BYPASS_PRIORITY))
                        .await?;
                    assert_eq!(module.queue().snapshot().pending, 1);
                    Ok(())
                })),
        )
        .unwrap();

    manager.start_all().await.unwrap();
    assert_eq!(module.status(), ModuleStatus::Ready);
    assert!(shoal_testkit::eventually(Duration::from_secs(1), || log.len() == 2).await);
    assert_eq!(log.labels(), ["migrate", "query"]);
}

#[tokio::test]
async fn lockdown_stops_new_work_and_is_permanent() {
    let manager = ModuleManager::default();
    let log = ExecutionLog::new();
    let gate = Gate::new();
    let module = manager
        .register(
            ModuleBuilder::new("db")
                .with_concurrency(1)
                .with_job("held", TestHandler::gated(&gate).recorded(&log))
                .with_job("echo", TestHandler::Echo.recorded(&log)),
        )
        .unwrap();
    manager.start_all().await.unwrap();

    let running = module.run_job(JobRequest::new("held"));
    assert!(wait_for_running(&module, 1).await);
    let _pending = module.run_job(JobRequest::new("echo"));

    manager.lockdown_all();
    assert_eq!(module.status(), ModuleStatus::Lockdown);
    assert!(!module.set_status(ModuleStatus::Ready));

    // In-flight work finishes; queued work never starts.
    gate.open();
    running.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(log.labels(), ["held"]);
    assert_eq!(module.queue().snapshot().pending, 1);

    assert!(matches!(manager.start_all().await, Err(SchedulerError::Lockdown)));
    assert!(matches!(
        manager.register(ModuleBuilder::new("late")),
        Err(SchedulerError::Lockdown)
    ));
}

struct TokenGuard;

#[async_trait]
impl JobGuard for TokenGuard {
    fn guards(&self, job: &str) -> bool {
        job == "secret"
    }

    async fn check(&self, ctx: &JobContext) -> anyhow::Result<()> {
        ctx.run_child(JobRequest::new("authorize").with_payload(ctx.job().payload().clone()))
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn guard_runs_permission_checks_as_jobs() {
    let manager = ModuleManager::default();
    let module = manager
        .register(
            ModuleBuilder::new("vault")
                .with_concurrency(1)
                .with_guard(TokenGuard)
                .with_job("secret", handler_fn(|_ctx, _payload| async { Ok(json!("s3cr3t")) }))
                .with_job("public", TestHandler::Echo)
                .with_job(
                    "authorize",
                    handler_fn(|_ctx, payload: Value| async move {
                        match payload["token"].as_str() {
                            Some("letmein") => Ok(Value::Bool(true)),
                            _ => anyhow::bail!("missing token"),
                        }
                    }),
                ),
        )
        .unwrap();
    manager.start_all().await.unwrap();

    let err = module.run_job(JobRequest::new("secret")).await.unwrap_err();
    assert!(
        matches!(err, JobError::Denied(ref message) if message.contains("missing token")),
        "{err:?}"
    );

    let value = module
        .run_job(JobRequest::new("secret").with_payload(json!({ "token": "letmein" })))
        .await
        .unwrap();
    assert_eq!(value, json!("s3cr3t"));

    // Unguarded names never reach the guard.
    module.run_job(JobRequest::new("public")).await.unwrap();
    assert_eq!(module.job_statistics("authorize").unwrap().added, 2);
}

#[tokio::test]
async fn panics_and_errors_reject_only_the_job() {
    let manager = ModuleManager::default();
    let module = manager
        .register(
            ModuleBuilder::new("worker")
                .with_job("explode", TestHandler::panicking("kaboom"))
                .with_job("fail", TestHandler::failing("bad input"))
                .with_job("echo", TestHandler::Echo),
        )
        .unwrap();
    manager.start_all().await.unwrap();

    let err = module.run_job(JobRequest::new("explode")).await.unwrap_err();
    assert_eq!(err, JobError::Panicked("kaboom".into()));

    let err = module.run_job(JobRequest::new("fail")).await.unwrap_err();
    assert_eq!(err, JobError::Failed("bad input".into()));

    // The module keeps serving.
    let echoed = module
        .run_job(JobRequest::new("echo").with_payload(json!(1)))
        .await
        .unwrap();
    assert_eq!(echoed, json!(1));
    assert_eq!(module.queue().snapshot().running, 0);

    let stats = module.statistics();
    assert_eq!((stats["explode"].added, stats["explode"].failed), (1, 1));
    assert_eq!((stats["fail"].added, stats["fail"].failed), (1, 1));
    assert_eq!((stats["echo"].successful, stats["echo"].total), (1, 1));
}

#[tokio::test]
async fn panicking_listener_does_not_leak_the_slot() {
    let manager = ModuleManager::default();
    let module = manager
        .register(
            ModuleBuilder::new("worker")
                .with_concurrency(1)
                .with_job(
                    "chatty",
                    handler_fn(|ctx, payload| async move {
                        ctx.progress(ProgressEvent::update("u1"));
                        // Buffered, so it is flushed after the body returns.
                        ctx.progress(ProgressEvent::update("u2"));
                        Ok(payload)
                    }),
                )
                .with_job("echo", TestHandler::Echo),
        )
        .unwrap();
    manager.start_all().await.unwrap();

    let chatty = module.run_job(
        JobRequest::new("chatty")
            .with_payload(json!("said it"))
            .on_progress(|_id: JobId, event: &ProgressEvent| {
                if event.message.as_deref() == Some("u2") {
                    panic!("listener blew up");
                }
            }),
    );
    let value = tokio::time::timeout(Duration::from_secs(1), chatty)
        .await
        .expect("job settles")
        .unwrap();
    assert_eq!(value, json!("said it"));
    assert_eq!(module.queue().snapshot().running, 0);

    let echo = module.run_job(JobRequest::new("echo"));
    let next = tokio::time::timeout(Duration::from_secs(1), echo)
        .await
        .expect("module still admits work");
    assert!(next.is_ok());
    assert_eq!(module.job_statistics("chatty").unwrap().successful, 1);
}
