//! Operator console over stdin/stdout.
//!
//! Registers a couple of demo modules, starts them and then reads one JSON
//! command per line from stdin, writing one JSON reply per line to stdout.
//! Logs go to stderr; set `RUST_LOG=shoal=debug` for scheduling detail.
//!
//! ```text
//! $ cargo run --example console
//! {"command":"status"}
//! {"command":"run","module":"db","job":"vacuum","payload":{"table":"users"},"wait":true}
//! {"command":"run","module":"reports","job":"daily","payload":{"children":[{"job":"query","payload":1}]}}
//! {"command":"inspect","job_id":"<id from the submitted reply>"}
//! {"command":"stats"}
//! {"command":"lockdown"}
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use shoal::{
    JobRequest, ModuleBuilder, ModuleManager, Operator, ProgressEvent, ShoalConfig, handler_fn,
    initializer_fn,
};
use shoal_testkit::{TestHandler, fan_out};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=info,console=info".into()),
        )
        .init();

    // SHOAL_CONFIG names an optional TOML file; SHOAL_* variables override it.
    let config_path = std::env::var_os("SHOAL_CONFIG").map(PathBuf::from);
    let config = ShoalConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        ShoalConfig::default()
    });
    let manager = ModuleManager::new(config);

    manager.register(
        ModuleBuilder::new("db")
            .with_concurrency(2)
            .with_priority("vacuum", 50)
            .with_job("query", TestHandler::slow(Duration::from_millis(200)))
            .with_job(
                "vacuum",
                handler_fn(|ctx, payload| async move {
                    for step in 1..=5 {
                        ctx.progress(ProgressEvent::update(format!("pass {step}/5")));
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    ctx.progress(ProgressEvent::success("vacuumed"));
                    Ok(json!({ "vacuumed": payload["table"] }))
                }),
            )
            .with_initializer(initializer_fn(|module| async move {
                // Warm the pool before regular traffic is admitted.
                module
                    .run_job(JobRequest::new("query").with_priority(shoal::BYPASS_PRIORITY))
                    .await?;
                Ok(())
            })),
    )?;
    manager.register(
        ModuleBuilder::new("reports")
            .with_concurrency(1)
            .with_job("daily", fan_out())
            .with_job("query", TestHandler::slow(Duration::from_millis(50))),
    )?;

    manager.start_all().await?;
    tracing::info!("console ready; reading commands from stdin");

    let operator = Operator::new(manager);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    operator.serve(stdin, tokio::io::stdout()).await
}
